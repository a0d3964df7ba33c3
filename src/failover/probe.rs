//! Latency probing
//!
//! A probe is one timed TCP connect. Name resolution uses the system
//! resolver through tokio's `lookup_host`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};

use super::FailoverServer;

/// Measure the TCP connect latency to `host:port` in milliseconds
pub async fn tcp_ping(host: &str, port: u16, wait: Duration) -> Result<u32> {
    let target = format!("{host}:{port}");
    let start = Instant::now();
    match timeout(wait, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => {
            let elapsed = start.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
            drop(stream);
            Ok(elapsed)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::timeout(format!("tcp ping to {target}"))),
    }
}

/// Aggregate of repeated pings to one target
#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
    pub attempts: u32,
    pub successes: u32,
    pub min_ms: Option<u32>,
    pub avg_ms: Option<u32>,
    pub max_ms: Option<u32>,
}

/// Ping a target `count` times sequentially and aggregate the results
pub async fn tcp_ping_multiple(
    host: &str,
    port: u16,
    count: u32,
    wait: Duration,
) -> PingReport {
    let mut latencies = Vec::new();
    for _ in 0..count {
        if let Ok(ms) = tcp_ping(host, port, wait).await {
            latencies.push(ms);
        }
    }

    let successes = latencies.len() as u32;
    let (min_ms, avg_ms, max_ms) = if latencies.is_empty() {
        (None, None, None)
    } else {
        let sum: u64 = latencies.iter().map(|&v| u64::from(v)).sum();
        (
            latencies.iter().copied().min(),
            Some((sum / u64::from(successes)) as u32),
            latencies.iter().copied().max(),
        )
    };

    PingReport {
        attempts: count,
        successes,
        min_ms,
        avg_ms,
        max_ms,
    }
}

/// Probe many targets concurrently
///
/// Results come back in input order; a `None` latency means the target
/// failed or timed out.
pub async fn batch_ping(
    targets: &[(String, u16)],
    wait: Duration,
    concurrency: usize,
) -> Vec<Option<u32>> {
    let mut results = vec![None; targets.len()];
    let mut in_flight = FuturesUnordered::new();
    let mut next = 0;

    while next < targets.len() || !in_flight.is_empty() {
        while next < targets.len() && in_flight.len() < concurrency.max(1) {
            let (host, port) = targets[next].clone();
            let index = next;
            in_flight.push(async move { (index, tcp_ping(&host, port, wait).await.ok()) });
            next += 1;
        }
        if let Some((index, latency)) = in_flight.next().await {
            results[index] = latency;
        }
    }

    results
}

/// Pluggable latency probe, mocked in tests
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe one server; `None` means unreachable within the timeout
    async fn probe(&self, server: &FailoverServer, wait: Duration) -> Option<u32>;
}

/// Probe backed by real TCP connects
#[derive(Debug, Default)]
pub struct TcpProbe;

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, server: &FailoverServer, wait: Duration) -> Option<u32> {
        match tcp_ping(&server.address, server.port, wait).await {
            Ok(ms) => Some(ms),
            Err(e) => {
                debug!(server = %server.name, error = %e, "probe failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_measures_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let ms = tcp_ping("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(ms < 2000);
    }

    #[tokio::test]
    async fn ping_fails_on_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(tcp_ping("127.0.0.1", port, Duration::from_secs(2))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn multiple_pings_aggregate() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let report = tcp_ping_multiple("127.0.0.1", port, 3, Duration::from_secs(2)).await;
        assert_eq!(report.attempts, 3);
        assert_eq!(report.successes, 3);
        assert!(report.min_ms.unwrap() <= report.avg_ms.unwrap());
        assert!(report.avg_ms.unwrap() <= report.max_ms.unwrap());
    }

    #[tokio::test]
    async fn batch_ping_preserves_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = closed_listener.local_addr().unwrap().port();
        drop(closed_listener);

        let targets = vec![
            ("127.0.0.1".to_string(), open),
            ("127.0.0.1".to_string(), closed),
        ];
        let results = batch_ping(&targets, Duration::from_secs(2), 4).await;
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }
}
