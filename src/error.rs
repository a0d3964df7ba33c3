//! Error types for rayhost
//!
//! One flat taxonomy covers the whole runtime surface. Identity and
//! configuration errors are returned synchronously to the caller of the
//! triggering operation; packet-level failures (malformed, unrouted, dial
//! failure of a single flow) are never errors, only counters.

use std::io;

use thiserror::Error;

/// Top-level error type for the rayhost runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or inconsistent input, rejected before any state change
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Unknown instance ID or interface tag
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate interface tag or instance ID
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Conflicting state transition in progress on the same ID
    #[error("busy: {0}")]
    Busy(String),

    /// Dial attempted against an instance that is not running
    #[error("instance not running: {0}")]
    InstanceNotRunning(String),

    /// Outbound tag does not exist in the backing instance
    #[error("outbound not found: {0}")]
    OutboundNotFound(String),

    /// Callback set on a polling interface or vice versa
    #[error("delivery mode conflict: {0}")]
    ModeConflict(String),

    /// Blocking operation exceeded its deadline
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Failure reported by the backing proxy engine
    #[error("engine error: {0}")]
    Engine(String),

    /// I/O error not covered by another category
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an already-exists error
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    /// Create a busy error
    pub fn busy(what: impl Into<String>) -> Self {
        Self::Busy(what.into())
    }

    /// Create a mode-conflict error
    pub fn mode_conflict(msg: impl Into<String>) -> Self {
        Self::ModeConflict(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Check if this error is recoverable (the operation can be retried
    /// without operator intervention)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConfigInvalid(_)
            | Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::OutboundNotFound(_)
            | Self::ModeConflict(_) => false,
            Self::Busy(_) | Self::InstanceNotRunning(_) | Self::Timeout(_) => true,
            Self::Engine(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("missing outbounds");
        assert!(err.to_string().contains("missing outbounds"));
        assert!(matches!(err, Error::ConfigInvalid(_)));

        let err = Error::not_found("instance abc");
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(!Error::config("x").is_recoverable());
        assert!(!Error::already_exists("tun0").is_recoverable());
        assert!(!Error::mode_conflict("x").is_recoverable());
        assert!(Error::busy("start in progress").is_recoverable());
        assert!(Error::timeout("dial").is_recoverable());
        assert!(Error::InstanceNotRunning("abc".into()).is_recoverable());
    }

    #[test]
    fn test_io_error_recoverable() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "t").into();
        assert!(err.is_recoverable());

        let err: Error = io::Error::new(io::ErrorKind::PermissionDenied, "p").into();
        assert!(!err.is_recoverable());
    }
}
