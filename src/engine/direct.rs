//! Built-in direct engine
//!
//! `DirectEngine` is the reference [`ProxyEngine`] implementation. Each
//! outbound either connects straight to the destination (`direct`) or
//! refuses every dial (`block`). It exists so the runtime, bridge, and
//! failover layers can run against real sockets without an external proxy
//! core linked in.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use super::traits::{
    BoxedDatagram, BoxedStream, DatagramChannel, Dialer, EngineInstance, ProxyEngine,
};
use crate::error::{Error, Result};

/// Dial timeout applied when the caller passes `Duration::ZERO`
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct EngineConfig {
    #[serde(default)]
    outbounds: Vec<OutboundConfig>,
}

#[derive(Debug, Deserialize)]
struct OutboundConfig {
    tag: String,
    #[serde(rename = "type")]
    kind: String,
}

fn parse_config(config: &str) -> Result<EngineConfig> {
    let parsed: EngineConfig = serde_json::from_str(config)
        .map_err(|e| Error::config(format!("invalid engine config: {e}")))?;

    if parsed.outbounds.is_empty() {
        return Err(Error::config("engine config has no outbounds"));
    }

    let mut seen = HashMap::new();
    for outbound in &parsed.outbounds {
        if outbound.tag.is_empty() {
            return Err(Error::config("outbound tag must not be empty"));
        }
        if seen.insert(outbound.tag.clone(), ()).is_some() {
            return Err(Error::config(format!(
                "duplicate outbound tag: {}",
                outbound.tag
            )));
        }
        match outbound.kind.as_str() {
            "direct" | "block" => {}
            other => {
                return Err(Error::config(format!(
                    "unknown outbound type: {other}"
                )))
            }
        }
    }

    Ok(parsed)
}

/// Proxy engine whose outbounds dial the destination directly
#[derive(Debug, Default)]
pub struct DirectEngine;

impl DirectEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProxyEngine for DirectEngine {
    fn validate(&self, config: &str) -> Result<()> {
        parse_config(config).map(|_| ())
    }

    async fn start(&self, config: &str) -> Result<Box<dyn EngineInstance>> {
        let parsed = parse_config(config)?;

        let mut dialers: HashMap<String, Arc<dyn Dialer>> = HashMap::new();
        for outbound in parsed.outbounds {
            let dialer: Arc<dyn Dialer> = match outbound.kind.as_str() {
                "block" => Arc::new(BlockDialer {
                    tag: outbound.tag.clone(),
                }),
                _ => Arc::new(DirectDialer),
            };
            dialers.insert(outbound.tag, dialer);
        }

        debug!(outbounds = dialers.len(), "direct engine instance started");
        Ok(Box::new(DirectInstance { dialers }))
    }
}

struct DirectInstance {
    dialers: HashMap<String, Arc<dyn Dialer>>,
}

#[async_trait]
impl EngineInstance for DirectInstance {
    fn outbound(&self, tag: &str) -> Option<Arc<dyn Dialer>> {
        self.dialers.get(tag).cloned()
    }

    fn outbound_tags(&self) -> Vec<String> {
        self.dialers.keys().cloned().collect()
    }

    async fn shutdown(&self) {
        // Direct outbounds hold no long-lived resources; per-flow sockets
        // close when their relay tasks stop.
        debug!("direct engine instance shut down");
    }
}

fn effective_timeout(requested: Duration) -> Duration {
    if requested.is_zero() {
        DEFAULT_DIAL_TIMEOUT
    } else {
        requested
    }
}

/// Dialer that connects straight to the destination
struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial_stream(&self, addr: SocketAddr, dial_timeout: Duration) -> Result<BoxedStream> {
        let wait = effective_timeout(dial_timeout);
        let stream = timeout(wait, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout(format!("connect to {addr} timed out")))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn dial_datagram(&self, addr: SocketAddr, _timeout: Duration) -> Result<BoxedDatagram> {
        // UDP connect only records the remote address, it cannot block.
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        Ok(Box::new(DirectDatagram { socket }))
    }
}

struct DirectDatagram {
    socket: UdpSocket,
}

#[async_trait]
impl DatagramChannel for DirectDatagram {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}

/// Dialer that refuses every connection
struct BlockDialer {
    tag: String,
}

#[async_trait]
impl Dialer for BlockDialer {
    async fn dial_stream(&self, addr: SocketAddr, _timeout: Duration) -> Result<BoxedStream> {
        debug!(tag = %self.tag, %addr, "blocked stream dial");
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "outbound is blocked").into())
    }

    async fn dial_datagram(&self, addr: SocketAddr, _timeout: Duration) -> Result<BoxedDatagram> {
        debug!(tag = %self.tag, %addr, "blocked datagram dial");
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "outbound is blocked").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"{"outbounds":[{"tag":"proxy","type":"direct"},{"tag":"deny","type":"block"}]}"#;

    #[test]
    fn validate_accepts_direct_and_block() {
        assert!(DirectEngine::new().validate(GOOD).is_ok());
    }

    #[test]
    fn validate_rejects_bad_input() {
        let engine = DirectEngine::new();
        assert!(engine.validate("not json").is_err());
        assert!(engine.validate(r#"{"outbounds":[]}"#).is_err());
        assert!(engine
            .validate(r#"{"outbounds":[{"tag":"","type":"direct"}]}"#)
            .is_err());
        assert!(engine
            .validate(r#"{"outbounds":[{"tag":"a","type":"direct"},{"tag":"a","type":"block"}]}"#)
            .is_err());
        assert!(engine
            .validate(r#"{"outbounds":[{"tag":"a","type":"socks"}]}"#)
            .is_err());
    }

    #[tokio::test]
    async fn start_exposes_configured_outbounds() {
        let instance = DirectEngine::new().start(GOOD).await.unwrap();
        assert!(instance.outbound("proxy").is_some());
        assert!(instance.outbound("deny").is_some());
        assert!(instance.outbound("missing").is_none());
        let mut tags = instance.outbound_tags();
        tags.sort();
        assert_eq!(tags, vec!["deny", "proxy"]);
    }

    #[tokio::test]
    async fn blocked_outbound_refuses_dials() {
        let instance = DirectEngine::new().start(GOOD).await.unwrap();
        let deny = instance.outbound("deny").unwrap();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(deny.dial_stream(addr, Duration::ZERO).await.is_err());
        assert!(deny.dial_datagram(addr, Duration::ZERO).await.is_err());
    }
}
