//! SOCKS5 client used for `.onion` relays.
//!
//! The target hostname is sent to the proxy unresolved, so `.onion`
//! names are resolved inside Tor.

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use super::error::{RelayError, RelayResult};
use crate::config::ProxyConfig;

/// Opens a TCP stream to `host:port` through the SOCKS5 proxy.
///
/// # Errors
///
/// Returns [`RelayError::ProxyUnreachable`] if the proxy cannot be reached
/// and [`RelayError::Socks`] if it refuses the request or answers
/// something other than SOCKS5.
pub async fn connect(proxy: &ProxyConfig, host: &str, port: u16) -> RelayResult<TcpStream> {
    let stream = Socks5Stream::connect((proxy.host.as_str(), proxy.port), (host, port))
        .await
        .map_err(|e| match e {
            tokio_socks::Error::Io(_) | tokio_socks::Error::ProxyServerUnreachable => {
                RelayError::ProxyUnreachable {
                    addr: proxy.addr(),
                    reason: e.to_string(),
                }
            }
            other => RelayError::Socks(other.to_string()),
        })?;

    Ok(stream.into_inner())
}

/// Server side of a no-auth SOCKS5 CONNECT, for tests.
///
/// Answers the greeting, reads the request and replies with `rep`.
/// Returns the requested host and port.
#[cfg(test)]
pub(super) async fn accept_connect(conn: &mut TcpStream, rep: u8) -> (String, u16) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut greeting = [0u8; 2];
    conn.read_exact(&mut greeting).await.unwrap();
    assert_eq!(greeting[0], 0x05);
    let mut methods = vec![0u8; usize::from(greeting[1])];
    conn.read_exact(&mut methods).await.unwrap();
    assert!(methods.contains(&0x00));
    conn.write_all(&[0x05, 0x00]).await.unwrap();

    // Domain-name CONNECT only.
    let mut head = [0u8; 5];
    conn.read_exact(&mut head).await.unwrap();
    assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
    let mut host = vec![0u8; usize::from(head[4])];
    conn.read_exact(&mut host).await.unwrap();
    let mut port = [0u8; 2];
    conn.read_exact(&mut port).await.unwrap();

    conn.write_all(&[0x05, rep, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await
        .unwrap();

    (String::from_utf8(host).unwrap(), u16::from_be_bytes(port))
}
