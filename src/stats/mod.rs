//! Traffic statistics
//!
//! Runtime-wide traffic counters shared by every interface. Counters are
//! relaxed atomics; a snapshot is not a consistent cut across all fields and
//! does not need to be.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic traffic counters
#[derive(Debug, Default)]
pub struct TrafficStats {
    /// Bytes relayed from local flows to outbounds
    uplink_bytes: AtomicU64,
    /// Bytes relayed from outbounds back to local flows
    downlink_bytes: AtomicU64,
    /// Currently open flows
    active_flows: AtomicU64,
    /// Flows opened since start (or last reset)
    total_flows: AtomicU64,
}

impl TrafficStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_uplink(&self, bytes: u64) {
        self.uplink_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downlink(&self, bytes: u64) {
        self.downlink_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn flow_opened(&self) {
        self.active_flows.fetch_add(1, Ordering::Relaxed);
        self.total_flows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_closed(&self) {
        self.active_flows.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn uplink_bytes(&self) -> u64 {
        self.uplink_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn downlink_bytes(&self) -> u64 {
        self.downlink_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_flows(&self) -> u64 {
        self.active_flows.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_flows(&self) -> u64 {
        self.total_flows.load(Ordering::Relaxed)
    }

    /// Snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            uplink_bytes: self.uplink_bytes(),
            downlink_bytes: self.downlink_bytes(),
            active_flows: self.active_flows(),
            total_flows: self.total_flows(),
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Reset the byte and total-flow counters; active flows stay as-is
    pub fn reset(&self) {
        self.uplink_bytes.store(0, Ordering::Relaxed);
        self.downlink_bytes.store(0, Ordering::Relaxed);
        self.total_flows.store(0, Ordering::Relaxed);
    }
}

/// Serializable point-in-time view of [`TrafficStats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub uplink_bytes: u64,
    pub downlink_bytes: u64,
    pub active_flows: u64,
    pub total_flows: u64,
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = TrafficStats::new();
        stats.add_uplink(100);
        stats.add_uplink(50);
        stats.add_downlink(200);
        stats.flow_opened();
        stats.flow_opened();
        stats.flow_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.uplink_bytes, 150);
        assert_eq!(snap.downlink_bytes, 200);
        assert_eq!(snap.active_flows, 1);
        assert_eq!(snap.total_flows, 2);
    }

    #[test]
    fn reset_keeps_active_flows() {
        let stats = TrafficStats::new();
        stats.add_uplink(10);
        stats.flow_opened();
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.uplink_bytes, 0);
        assert_eq!(snap.total_flows, 0);
        assert_eq!(snap.active_flows, 1);
    }
}
