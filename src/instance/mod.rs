//! Engine instance lifecycle
//!
//! The registry owns every engine instance the host has created and
//! serializes lifecycle transitions per instance. Identifiers are opaque
//! strings handed back to the host on `create`.

mod adapter;
mod registry;

pub use adapter::DialerAdapter;
pub use registry::InstanceRegistry;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier for one engine instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of an engine instance
///
/// `stop` returns an instance to `Stopped`, from which `start` may run it
/// again. Destroyed instances leave the registry entirely and have no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time description of one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub state: InstanceState,
    /// Seconds since the current run started, `None` unless running
    pub uptime_seconds: Option<u64>,
    /// Unix timestamp of the current run's start, `None` unless running
    pub started_at_unix: Option<u64>,
}
