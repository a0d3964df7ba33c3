//! Dialer adapter binding one outbound route to the bridge
//!
//! The adapter resolves the live dialer through the registry on every dial,
//! so a stopped or destroyed instance fails fast instead of living on in a
//! stale `Arc`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{BoxedDatagram, BoxedStream, Dialer, DEFAULT_OUTBOUND_TAG};
use crate::error::Result;

use super::{InstanceId, InstanceRegistry};

/// Dials through a named outbound of one registered instance
pub struct DialerAdapter {
    registry: Arc<InstanceRegistry>,
    instance_id: InstanceId,
    outbound_tag: String,
}

impl DialerAdapter {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        instance_id: InstanceId,
        outbound_tag: impl Into<String>,
    ) -> Self {
        let mut outbound_tag = outbound_tag.into();
        if outbound_tag.is_empty() {
            outbound_tag = DEFAULT_OUTBOUND_TAG.to_string();
        }
        Self {
            registry,
            instance_id,
            outbound_tag,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn outbound_tag(&self) -> &str {
        &self.outbound_tag
    }
}

#[async_trait]
impl Dialer for DialerAdapter {
    async fn dial_stream(&self, addr: SocketAddr, timeout: Duration) -> Result<BoxedStream> {
        let dialer = self
            .registry
            .checked_dialer(&self.instance_id, &self.outbound_tag)?;
        dialer.dial_stream(addr, timeout).await
    }

    async fn dial_datagram(&self, addr: SocketAddr, timeout: Duration) -> Result<BoxedDatagram> {
        let dialer = self
            .registry
            .checked_dialer(&self.instance_id, &self.outbound_tag)?;
        dialer.dial_datagram(addr, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DirectEngine;
    use crate::error::Error;

    #[tokio::test]
    async fn adapter_fails_once_instance_stops() {
        let reg = Arc::new(InstanceRegistry::new(Arc::new(DirectEngine::new())));
        let id = reg
            .create(r#"{"outbounds":[{"tag":"proxy","type":"direct"}]}"#)
            .unwrap();
        reg.start(&id).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let adapter = DialerAdapter::new(Arc::clone(&reg), id.clone(), "");
        assert_eq!(adapter.outbound_tag(), DEFAULT_OUTBOUND_TAG);
        assert!(adapter.dial_stream(addr, Duration::ZERO).await.is_ok());

        reg.stop(&id).await.unwrap();
        assert!(matches!(
            adapter.dial_stream(addr, Duration::ZERO).await,
            Err(Error::InstanceNotRunning(_))
        ));
    }
}
