//! Nostr over Tor command line client.
//!
//! Connects to `.onion` relays through a local Tor SOCKS5 proxy, subscribes
//! to recent notes and prints what arrives for a fixed observation window.
//!
//! # Usage
//!
//! ```bash
//! # Default onion relays
//! nostr-tor
//!
//! # One specific onion relay
//! nostr-tor ws://your-relay.onion
//!
//! # Tor Browser's proxy port, longer window, metadata and notes
//! nostr-tor --proxy-port 9150 --observe-secs 60 --kinds 0,1 --limit 20
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat};
use clap::Parser;
use nostr::Event;
use nostr_tor_client::relay::{is_onion_url, ConnectivityProbe, RelayEndpoint, SubscriptionEvent};
use nostr_tor_client::{ClientConfig, RelayPool};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Characters of note content shown per event.
const CONTENT_PREVIEW_CHARS: usize = 100;

/// Characters of ids and pubkeys shown per event.
const SHORT_HEX_CHARS: usize = 8;

/// Nostr over Tor client.
#[derive(Parser, Debug)]
#[command(name = "nostr-tor")]
#[command(about = "Observe Nostr onion relays through a Tor SOCKS5 proxy")]
#[command(version)]
struct Args {
    /// Onion relay to connect to (default: built-in relay list)
    relay: Option<String>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// SOCKS5 proxy host
    #[arg(long)]
    proxy_host: Option<String>,

    /// SOCKS5 proxy port
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Seconds to observe events before exiting
    #[arg(long)]
    observe_secs: Option<u64>,

    /// Event kinds to subscribe to, comma separated
    #[arg(long, value_delimiter = ',')]
    kinds: Option<Vec<u16>>,

    /// Maximum number of stored events per relay
    #[arg(long)]
    limit: Option<usize>,
}

impl Args {
    /// Loads the configuration file, if any, and applies flag overrides.
    fn config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                ClientConfig::from_json(&raw)
                    .with_context(|| format!("Invalid config: {}", path.display()))?
            }
            None => ClientConfig::default(),
        };

        if self.proxy_host.is_some() || self.proxy_port.is_some() {
            let host = self.proxy_host.clone().unwrap_or_else(|| config.proxy.host.clone());
            let port = self.proxy_port.unwrap_or(config.proxy.port);
            config = config.with_proxy(host, port);
        }
        if let Some(secs) = self.observe_secs {
            config = config.with_observation_window(Duration::from_secs(secs));
        }
        if self.kinds.is_some() || self.limit.is_some() {
            let kinds = self.kinds.clone().unwrap_or_else(|| vec![1]);
            let limit = self.limit.unwrap_or(5);
            config = config.with_filters(vec![json!({"kinds": kinds, "limit": limit})]);
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Starting Nostr over Tor client");

    let config = args.config()?;

    let relays = match &args.relay {
        Some(relay) if is_onion_url(relay) => {
            info!("Testing custom .onion relay: {relay}");
            vec![relay.clone()]
        }
        Some(relay) => {
            bail!("Invalid relay URL {relay}. Please provide a .onion relay URL, e.g. nostr-tor ws://your-relay.onion");
        }
        None => {
            info!("Using default relays. To test a specific relay: nostr-tor ws://your-relay.onion");
            config.default_relays.clone()
        }
    };

    let needs_proxy = relays
        .iter()
        .any(|url| RelayEndpoint::parse(url).is_ok_and(|e| e.requires_anonymity()));
    if needs_proxy {
        info!("Testing Tor connectivity...");
        if let Err(e) = ConnectivityProbe::from_config(&config).check().await {
            warn!(
                "Cannot connect to Tor. Make sure the Tor daemon is running on {}",
                config.proxy.addr()
            );
            warn!("Try: systemctl start tor (Linux) or brew services start tor (macOS)");
            return Err(e).context("Tor proxy unreachable");
        }
    }

    let pool = RelayPool::new(config.clone());
    let summary = pool.connect_all(&relays).await;
    for failure in summary.results.iter().filter(|r| !r.success) {
        warn!(
            "Failed to connect to {}: {}",
            failure.url,
            failure.error.as_deref().unwrap_or("unknown error")
        );
    }
    if summary.is_empty() {
        bail!("No relays connected");
    }

    info!("Subscribing to recent notes...");
    let (tx, mut rx) = mpsc::unbounded_channel::<SubscriptionEvent>();
    let subscription = pool
        .subscribe_all(config.default_filters.clone(), Arc::new(tx))
        .await;

    let printer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                SubscriptionEvent::Event { relay_url, event, .. } => {
                    println!("{}", summarize(&relay_url, &event));
                }
                SubscriptionEvent::Eose { relay_url, .. } => {
                    println!("End of stored events from {relay_url}");
                }
            }
        }
    });

    tokio::time::sleep(config.observation_window).await;

    info!("Disconnecting...");
    pool.close_subscription(&subscription.id).await;
    pool.disconnect_all().await;
    printer.abort();
    info!("Disconnected from all relays");

    Ok(())
}

/// One-line description of an event.
fn summarize(relay_url: &str, event: &Event) -> String {
    let id = event.id.to_hex();
    let pubkey = event.pubkey.to_hex();
    let content: String = event.content.chars().take(CONTENT_PREVIEW_CHARS).collect();
    let created_at = i64::try_from(event.created_at.as_secs())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map_or_else(
            || event.created_at.as_secs().to_string(),
            |t| t.to_rfc3339_opts(SecondsFormat::Millis, true),
        );

    format!(
        "Event from {relay_url}: id={} pubkey={} created_at={created_at} content={content:?}",
        &id[..SHORT_HEX_CHARS],
        &pubkey[..SHORT_HEX_CHARS],
    )
}
