//! Capability trait definitions for the proxy-engine seam

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Outbound tag used when the caller supplies an empty string
pub const DEFAULT_OUTBOUND_TAG: &str = "proxy";

/// A byte stream tunneled through an engine outbound
///
/// Blanket-implemented for anything that reads and writes asynchronously, so
/// engine implementations can hand back plain `TcpStream`s or wrapped
/// protocol streams alike.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

/// Boxed stream returned by [`Dialer::dial_stream`]
pub type BoxedStream = Box<dyn ProxyStream>;

/// A connected datagram channel tunneled through an engine outbound
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// Send one datagram to the connected remote
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram from the connected remote
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Boxed datagram channel returned by [`Dialer::dial_datagram`]
pub type BoxedDatagram = Box<dyn DatagramChannel>;

/// Capability to open a connection through one named outbound route
///
/// A `Dialer` is "open a stream or datagram channel to address X, tunneled
/// through this route" and nothing more; which proxy protocol backs the route
/// is the engine's business.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a byte stream to `addr`
    ///
    /// A zero `timeout` selects the engine's documented default; the dial
    /// never waits forever.
    async fn dial_stream(&self, addr: SocketAddr, timeout: Duration) -> Result<BoxedStream>;

    /// Open a connected datagram channel to `addr`
    async fn dial_datagram(&self, addr: SocketAddr, timeout: Duration) -> Result<BoxedDatagram>;
}

/// One running copy of a proxy engine
#[async_trait]
pub trait EngineInstance: Send + Sync {
    /// Look up the dialer for a named outbound route
    fn outbound(&self, tag: &str) -> Option<Arc<dyn Dialer>>;

    /// Tags of every outbound route this instance carries
    fn outbound_tags(&self) -> Vec<String>;

    /// Tear the instance down, closing engine-side resources
    async fn shutdown(&self);
}

/// Factory for engine instances
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Validate a configuration without side effects
    ///
    /// Called eagerly by the registry so that `create` can reject bad input
    /// before an entry exists.
    fn validate(&self, config: &str) -> Result<()>;

    /// Start a new instance from a validated configuration
    async fn start(&self, config: &str) -> Result<Box<dyn EngineInstance>>;
}
