//! Integration tests for multi-relay fan-out.

mod helpers;

use std::sync::Arc;

use helpers::{fast_config, note, urls};
use nostr_tor_client::relay::testing::{MockBehavior, MockConnector};
use nostr_tor_client::relay::{Connector, SubscriptionEvent, Transports};
use nostr_tor_client::RelayPool;
use serde_json::json;
use tokio::sync::mpsc;

const RELAY_A: &str = "ws://q6a7m5qkyonzb5fk5yv4jyu3ar44hqedn7wjopg737lit2ckkhx2nyid.onion";
const RELAY_B: &str = "ws://gp5kiwqfw7t2fwb3rfts2aekoph4x7pj5pv65re2y6hzaujsxewanbqd.onion";
const RELAY_C: &str = "ws://cccccccccccccccccccccccccccccccccccccccccccccccccccccccc.onion";

fn pool_with(connector: &Arc<MockConnector>) -> RelayPool {
    RelayPool::with_transports(
        fast_config(),
        Transports::uniform(Arc::clone(connector) as Arc<dyn Connector>),
    )
}

#[tokio::test]
async fn timed_out_relay_is_left_out_of_live_set() {
    let connector = Arc::new(MockConnector::new().with_behavior(RELAY_B, MockBehavior::Hang));
    let pool = pool_with(&connector);

    let summary = pool.connect_all(&urls(&[RELAY_A, RELAY_B])).await;

    assert_eq!(summary.to_string(), "1/2 connected");
    assert_eq!(pool.relay_urls().await, vec![RELAY_A.to_string()]);
    assert_eq!(pool.connected_count().await, 1);

    let timed_out = summary
        .results
        .iter()
        .find(|r| r.url == RELAY_B)
        .expect("result for B");
    assert!(!timed_out.success);
    assert!(timed_out.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn all_relays_failing_gives_empty_summary() {
    let connector = Arc::new(MockConnector::with_fallback(MockBehavior::Fail(
        "connection refused".to_string(),
    )));
    let pool = pool_with(&connector);

    let summary = pool.connect_all(&urls(&[RELAY_A, RELAY_B])).await;

    assert!(summary.is_empty());
    assert_eq!(summary.results.len(), 2);
    assert!(pool.relay_urls().await.is_empty());
}

#[tokio::test]
async fn publish_all_reports_one_result_per_relay() {
    let connector = Arc::new(
        MockConnector::with_fallback(MockBehavior::AutoAck {
            accepted: true,
            message: String::new(),
        })
        .with_behavior(
            RELAY_B,
            MockBehavior::AutoAck {
                accepted: false,
                message: "rate-limited: slow down".to_string(),
            },
        ),
    );
    let pool = pool_with(&connector);
    pool.connect_all(&urls(&[RELAY_A, RELAY_B, RELAY_C])).await;

    let results = pool.publish_all(&note("fan out")).await;

    assert_eq!(results.len(), 3);
    assert_eq!(results.iter().filter(|r| r.success).count(), 2);
    let failure = results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failure.url, RELAY_B);
    assert!(failure
        .error
        .as_deref()
        .unwrap()
        .contains("rate-limited: slow down"));
}

#[tokio::test]
async fn publish_all_mixes_timeouts_and_acks() {
    let connector = Arc::new(
        MockConnector::with_fallback(MockBehavior::AutoAck {
            accepted: true,
            message: String::new(),
        })
        .with_behavior(RELAY_C, MockBehavior::Open),
    );
    let pool = pool_with(&connector);
    pool.connect_all(&urls(&[RELAY_A, RELAY_C])).await;

    let results = pool.publish_all(&note("one silent relay")).await;

    let silent = results.iter().find(|r| r.url == RELAY_C).unwrap();
    assert!(!silent.success);
    assert!(silent.error.as_deref().unwrap().contains("timed out"));
    assert!(results.iter().find(|r| r.url == RELAY_A).unwrap().success);
}

#[tokio::test]
async fn subscribe_all_sends_same_filters_everywhere() {
    let connector = Arc::new(MockConnector::new());
    let pool = pool_with(&connector);
    pool.connect_all(&urls(&[RELAY_A, RELAY_B])).await;
    let mut relay_a = connector.take_relay(RELAY_A).unwrap();
    let mut relay_b = connector.take_relay(RELAY_B).unwrap();

    let filters = vec![
        json!({"kinds": [1], "limit": 5}),
        json!({"kinds": [0], "authors": ["deadbeef"]}),
    ];
    let (tx, mut rx) = mpsc::unbounded_channel::<SubscriptionEvent>();
    let sub = pool.subscribe_all(filters.clone(), Arc::new(tx)).await;

    assert_eq!(sub.succeeded(), 2);
    for relay in [&mut relay_a, &mut relay_b] {
        let req = relay.next_frame().await.unwrap();
        assert_eq!(req[0], "REQ");
        assert_eq!(&req[2..], filters.as_slice());
        relay.send(json!(["EOSE", req[1]]).to_string());
    }

    let mut relays = Vec::new();
    for _ in 0..2 {
        match rx.recv().await.unwrap() {
            SubscriptionEvent::Eose {
                relay_url,
                subscription_id,
            } => {
                assert_eq!(subscription_id, sub.id);
                relays.push(relay_url);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    relays.sort();
    let mut expected = urls(&[RELAY_A, RELAY_B]);
    expected.sort();
    assert_eq!(relays, expected);
}

#[tokio::test]
async fn subscribe_all_reports_disconnected_relays() {
    let connector = Arc::new(MockConnector::new());
    let pool = pool_with(&connector);
    pool.connect_all(&urls(&[RELAY_A, RELAY_B])).await;
    let mut notifications = pool.notifications();

    // RELAY_B goes away but stays in the live set.
    connector.take_relay(RELAY_B).unwrap().close();
    while pool.connected_count().await != 1 {
        notifications.recv().await.unwrap();
    }

    let (tx, _rx) = mpsc::unbounded_channel::<SubscriptionEvent>();
    let sub = pool.subscribe_all(vec![json!({})], Arc::new(tx)).await;

    assert_eq!(sub.results.len(), 2);
    assert_eq!(sub.succeeded(), 1);
    let failure = sub.results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failure.url, RELAY_B);
}

#[tokio::test]
async fn disconnect_all_closes_everything_once() {
    let connector = Arc::new(MockConnector::new());
    let pool = pool_with(&connector);
    pool.connect_all(&urls(&[RELAY_A, RELAY_B])).await;
    let mut relay_a = connector.take_relay(RELAY_A).unwrap();

    let (tx, _rx) = mpsc::unbounded_channel::<SubscriptionEvent>();
    pool.subscribe_all(vec![json!({"kinds": [1]})], Arc::new(tx))
        .await;

    pool.disconnect_all().await;
    pool.disconnect_all().await;

    assert!(pool.relay_urls().await.is_empty());
    assert_eq!(relay_a.next_frame().await.unwrap()[0], "REQ");
    assert_eq!(relay_a.next_frame().await.unwrap()[0], "CLOSE");
    // The transport close command follows the CLOSE frame, once.
    assert!(relay_a.close_requested());
    assert!(!relay_a.close_requested());
}
