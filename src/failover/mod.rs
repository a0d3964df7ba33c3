//! Failover between proxy servers
//!
//! A background monitor probes the active server; after enough consecutive
//! failures it probes every candidate and switches to the healthy one with
//! the lowest latency. The host observes switches through a hook so it can
//! rebind interfaces.

mod controller;
mod probe;

pub use controller::{FailoverController, FailoverState, SwitchHook};
pub use probe::{batch_ping, tcp_ping, tcp_ping_multiple, HealthProbe, PingReport, TcpProbe};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default probe interval
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Default per-probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default consecutive failure threshold before switching
pub const DEFAULT_FAIL_THRESHOLD: u32 = 3;

/// One candidate server in the failover group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverServer {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Instance the host wants traffic rebound to when this server wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub outbound_tag: String,
    /// Last measured latency, absent until the first successful probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
}

/// Monitor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Time between probes of the active server
    #[serde(with = "humantime_secs", default = "default_interval")]
    pub interval: Duration,
    /// Consecutive failures before candidates are evaluated
    #[serde(default = "default_threshold")]
    pub fail_threshold: u32,
    /// Candidates above this latency are not eligible; zero disables the cap
    #[serde(default)]
    pub latency_limit_ms: u32,
    /// Per-probe timeout
    #[serde(with = "humantime_secs", default = "default_timeout")]
    pub probe_timeout: Duration,
}

fn default_interval() -> Duration {
    DEFAULT_PROBE_INTERVAL
}

fn default_timeout() -> Duration {
    DEFAULT_PROBE_TIMEOUT
}

fn default_threshold() -> u32 {
    DEFAULT_FAIL_THRESHOLD
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PROBE_INTERVAL,
            fail_threshold: DEFAULT_FAIL_THRESHOLD,
            latency_limit_ms: 0,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl FailoverConfig {
    /// Replace zero durations and thresholds with the documented defaults
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = DEFAULT_PROBE_INTERVAL;
        }
        if self.probe_timeout.is_zero() {
            self.probe_timeout = DEFAULT_PROBE_TIMEOUT;
        }
        if self.fail_threshold == 0 {
            self.fail_threshold = DEFAULT_FAIL_THRESHOLD;
        }
        self
    }
}

mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_config_values_normalize_to_defaults() {
        let config = FailoverConfig {
            interval: Duration::ZERO,
            fail_threshold: 0,
            latency_limit_ms: 0,
            probe_timeout: Duration::ZERO,
        }
        .normalized();

        assert_eq!(config.interval, DEFAULT_PROBE_INTERVAL);
        assert_eq!(config.probe_timeout, DEFAULT_PROBE_TIMEOUT);
        assert_eq!(config.fail_threshold, DEFAULT_FAIL_THRESHOLD);
    }

    #[test]
    fn server_round_trips_through_json() {
        let server = FailoverServer {
            name: "primary".into(),
            address: "proxy.example.net".into(),
            port: 443,
            instance_id: Some("abc".into()),
            outbound_tag: "proxy".into(),
            latency_ms: None,
        };
        let json = serde_json::to_string(&server).unwrap();
        let back: FailoverServer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "primary");
        assert_eq!(back.port, 443);
        assert!(back.latency_ms.is_none());
    }
}
