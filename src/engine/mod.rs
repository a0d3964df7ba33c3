//! The proxy-engine seam
//!
//! The runtime never speaks a proxy wire protocol itself. Everything behind
//! an instance is reached through three capability traits: [`ProxyEngine`]
//! creates instances from an opaque configuration, [`EngineInstance`] exposes
//! tag-addressed outbound routes, and [`Dialer`] opens stream or datagram
//! channels through one of those routes.
//!
//! [`DirectEngine`] is the built-in engine: its outbounds dial the target
//! directly (or refuse, for `block` outbounds). Real protocol engines plug in
//! through the same traits.

mod direct;
mod traits;

pub use direct::{DirectEngine, DEFAULT_DIAL_TIMEOUT};
pub use traits::{
    BoxedDatagram, BoxedStream, DatagramChannel, Dialer, EngineInstance, ProxyEngine, ProxyStream,
    DEFAULT_OUTBOUND_TAG,
};
