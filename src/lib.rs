//! rayhost: proxy engine runtime for host processes
//!
//! This crate embeds a proxy engine behind a stable host-facing surface:
//! engine instances with a managed lifecycle, virtual TUN-style interfaces
//! that turn raw IP packets into proxied flows, configurable egress packet
//! delivery, latency-based failover, and global traffic statistics.
//!
//! # Architecture
//!
//! ```text
//! Host packets → TunManager → PacketBridge → userspace TCP/IP stack
//!                                  ↓
//!                           per-flow relay tasks
//!                                  ↓
//!                    DialerAdapter → InstanceRegistry → ProxyEngine
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use rayhost::{Runtime, TunOptions};
//!
//! # async fn example() -> rayhost::Result<()> {
//! let runtime = Runtime::with_direct_engine();
//!
//! // Create and start an engine instance
//! let id = runtime.create_instance(r#"{"outbounds":[{"tag":"proxy","type":"direct"}]}"#)?;
//! runtime.start_instance(&id).await?;
//!
//! // Create an interface and route its traffic through the instance
//! let tag = runtime.create_tun("", TunOptions::default())?;
//! runtime.enable_polling(&tag)?;
//! runtime.bind_dialer(&tag, &id, "proxy")?;
//!
//! // Feed packets in, poll replies out
//! // runtime.write_packet(&tag, &ip_packet)?;
//! // let reply = runtime.read_packet(&tag)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`engine`]: proxy engine traits and the built-in direct engine
//! - [`instance`]: instance registry and lifecycle
//! - [`tun`]: virtual interfaces and egress delivery
//! - [`bridge`]: packet-to-flow bridging over a userspace stack
//! - [`failover`]: server health probing and failover
//! - [`stats`]: global traffic counters
//! - [`runtime`]: the facade tying it all together
//! - [`error`]: error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod bridge;
pub mod engine;
pub mod error;
pub mod failover;
pub mod instance;
pub mod runtime;
pub mod stats;
pub mod tun;

// Re-export commonly used types at the crate root
pub use engine::{Dialer, DirectEngine, EngineInstance, ProxyEngine};
pub use error::{Error, Result};
pub use failover::{FailoverConfig, FailoverController, FailoverServer, FailoverState};
pub use instance::{InstanceId, InstanceInfo, InstanceRegistry, InstanceState};
pub use runtime::Runtime;
pub use stats::{TrafficSnapshot, TrafficStats};
pub use tun::{DeliveryMode, TunInfo, TunManager, TunOptions};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
