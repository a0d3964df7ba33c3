//! Tuning constants for the packet bridge
//!
//! Channel depths and buffer sizes assume the default interface MTU of 1500
//! bytes. Timeouts follow common middlebox practice: long-lived TCP flows
//! survive five minutes of silence, UDP flows one minute, DNS lookups much
//! less.

use std::time::Duration;

/// Depth of the ingress packet channel (host -> stack)
pub const INGRESS_CHANNEL_SIZE: usize = 1024;

/// Depth of the egress packet channel (stack -> host)
///
/// Smaller than ingress; the router task drains it continuously and the
/// delivery slot applies its own bounded-buffer policy behind it.
pub const EGRESS_CHANNEL_SIZE: usize = 512;

/// TCP flows idle longer than this are reclaimed
pub const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// UDP flows idle longer than this are reclaimed
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for UDP flows whose destination port is 53
pub const UDP_DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the cleanup task scans for idle flows
pub const FLOW_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Hard cap on concurrent flows per interface
pub const MAX_FLOWS: usize = 4096;

/// Buffer size for per-direction relay copies
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Idle timeout for a UDP flow, shorter when it looks like DNS
#[must_use]
pub const fn udp_timeout_for_port(dst_port: u16) -> Duration {
    if dst_port == 53 {
        UDP_DNS_TIMEOUT
    } else {
        UDP_IDLE_TIMEOUT
    }
}
