//! Virtual interface manager
//!
//! Owns every interface by tag. An interface is a packet bridge plus a
//! delivery slot; whether the host feeds it from a real TUN file descriptor
//! or from its own packet source makes no difference here, the descriptor is
//! recorded and the host keeps doing its own reads and writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ipnet::IpNet;
use serde::Serialize;
use tracing::info;

use crate::bridge::{BridgeCountersSnapshot, PacketBridge};
use crate::error::{Error, Result};
use crate::instance::{DialerAdapter, InstanceId};
use crate::stats::TrafficStats;

use super::config::TunOptions;
use super::delivery::{DeliverySlot, DeliverySnapshot, DeliveryMode, PacketHandler};

/// One virtual interface
pub struct TunInterface {
    tag: String,
    options: TunOptions,
    created_at: Instant,
    bridge: PacketBridge,
    delivery: Arc<DeliverySlot>,
}

impl TunInterface {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn bridge(&self) -> &PacketBridge {
        &self.bridge
    }
}

/// Current binding of an interface
#[derive(Debug, Clone, Serialize)]
pub struct BindingInfo {
    pub instance_id: InstanceId,
    pub outbound_tag: String,
}

/// Serializable view of one interface
#[derive(Debug, Clone, Serialize)]
pub struct TunInfo {
    pub tag: String,
    pub addresses: Vec<IpNet>,
    pub mtu: u16,
    pub has_descriptor: bool,
    pub mode: DeliveryMode,
    pub binding: Option<BindingInfo>,
    pub counters: BridgeCountersSnapshot,
    pub delivery: DeliverySnapshot,
    pub flows: usize,
    pub uptime_seconds: u64,
}

/// Registry of virtual interfaces
pub struct TunManager {
    interfaces: DashMap<String, Arc<TunInterface>>,
    stats: Arc<TrafficStats>,
    auto_tag: AtomicU64,
}

impl TunManager {
    pub fn new(stats: Arc<TrafficStats>) -> Self {
        Self {
            interfaces: DashMap::new(),
            stats,
            auto_tag: AtomicU64::new(0),
        }
    }

    /// Create an interface; an empty tag picks the next `tun%d` name
    pub fn create(&self, tag: &str, options: TunOptions) -> Result<String> {
        options.validate()?;

        let tag = if tag.is_empty() {
            format!("tun{}", self.auto_tag.fetch_add(1, Ordering::SeqCst))
        } else {
            tag.to_string()
        };

        match self.interfaces.entry(tag.clone()) {
            Entry::Occupied(_) => Err(Error::already_exists(format!("interface {tag}"))),
            Entry::Vacant(slot) => {
                let delivery = Arc::new(DeliverySlot::new(options.output_capacity));
                // A callback preset still needs the handler installed later;
                // only polling can be armed up front.
                if options.mode == DeliveryMode::Polling {
                    delivery.enable_polling()?;
                }

                let bridge = PacketBridge::new(
                    tag.clone(),
                    options.mtu,
                    Arc::clone(&delivery),
                    Arc::clone(&self.stats),
                );
                bridge.start();

                info!(tag = %tag, mtu = options.mtu, fd = ?options.fd, "interface created");
                slot.insert(Arc::new(TunInterface {
                    tag: tag.clone(),
                    options,
                    created_at: Instant::now(),
                    bridge,
                    delivery,
                }));
                Ok(tag)
            }
        }
    }

    /// Create an interface over a host-owned descriptor
    ///
    /// The descriptor is recorded for diagnostics; packet I/O still goes
    /// through `write_packet` and the delivery slot.
    pub fn create_from_fd(&self, tag: &str, fd: i32, mut options: TunOptions) -> Result<String> {
        options.fd = Some(fd);
        self.create(tag, options)
    }

    /// Point an interface at a dialer, or unbind with `None`
    pub fn bind_dialer(&self, tag: &str, adapter: Option<Arc<DialerAdapter>>) -> Result<()> {
        self.interface(tag)?.bridge.bind(adapter);
        Ok(())
    }

    /// Feed one ingress packet into an interface
    pub fn write_packet(&self, tag: &str, packet: &[u8]) -> Result<()> {
        self.interface(tag)?.bridge.write_packet(packet);
        Ok(())
    }

    /// Install the egress packet callback
    pub fn set_output_callback(&self, tag: &str, handler: PacketHandler) -> Result<()> {
        self.interface(tag)?.delivery.set_callback(handler)
    }

    /// Reset the delivery slot to unset
    pub fn clear_output(&self, tag: &str) -> Result<()> {
        self.interface(tag)?.delivery.clear();
        Ok(())
    }

    /// Switch an interface to polling delivery
    pub fn enable_polling(&self, tag: &str) -> Result<()> {
        self.interface(tag)?.delivery.enable_polling()
    }

    /// Pop the oldest egress packet of a polling interface
    pub fn read_packet(&self, tag: &str) -> Result<Option<BytesMut>> {
        self.interface(tag)?.delivery.read()
    }

    pub fn info(&self, tag: &str) -> Result<TunInfo> {
        let iface = self.interface(tag)?;
        Ok(Self::describe(&iface))
    }

    pub fn list(&self) -> Vec<TunInfo> {
        self.interfaces
            .iter()
            .map(|e| Self::describe(e.value()))
            .collect()
    }

    fn describe(iface: &TunInterface) -> TunInfo {
        TunInfo {
            tag: iface.tag.clone(),
            addresses: iface.options.addresses.clone(),
            mtu: iface.options.mtu,
            has_descriptor: iface.options.fd.is_some(),
            mode: iface.delivery.mode(),
            binding: iface.bridge.binding().map(|a| BindingInfo {
                instance_id: a.instance_id().clone(),
                outbound_tag: a.outbound_tag().to_string(),
            }),
            counters: iface.bridge.counters(),
            delivery: iface.delivery.snapshot(),
            flows: iface.bridge.flow_count(),
            uptime_seconds: iface.created_at.elapsed().as_secs(),
        }
    }

    /// Remove an interface, quiescing its bridge first
    pub async fn remove(&self, tag: &str) -> Result<()> {
        let (_, iface) = self
            .interfaces
            .remove(tag)
            .ok_or_else(|| Error::not_found(format!("interface {tag}")))?;
        iface.bridge.stop().await;
        iface.delivery.clear();
        info!(tag = %tag, "interface removed");
        Ok(())
    }

    /// Remove every interface
    pub async fn close_all(&self) {
        let tags: Vec<String> = self.interfaces.iter().map(|e| e.key().clone()).collect();
        for tag in tags {
            let _ = self.remove(&tag).await;
        }
    }

    /// Abort flows dialed through `instance_id` on every interface
    pub fn cancel_flows_for_instance(&self, instance_id: &InstanceId) -> usize {
        self.interfaces
            .iter()
            .map(|e| e.bridge.cancel_flows_for_instance(instance_id))
            .sum()
    }

    /// Rebind every currently bound interface to `adapter`
    ///
    /// In-flight flows drain on their old route; only new flows pick up the
    /// replacement.
    pub fn rebind_all(&self, adapter: &Arc<DialerAdapter>) -> usize {
        let mut rebound = 0;
        for iface in &self.interfaces {
            if iface.bridge.binding().is_some() {
                iface.bridge.bind(Some(Arc::clone(adapter)));
                rebound += 1;
            }
        }
        rebound
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.interfaces.contains_key(tag)
    }

    fn interface(&self, tag: &str) -> Result<Arc<TunInterface>> {
        self.interfaces
            .get(tag)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::not_found(format!("interface {tag}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TunManager {
        TunManager::new(Arc::new(TrafficStats::new()))
    }

    #[tokio::test]
    async fn auto_tags_are_sequential() {
        let mgr = manager();
        let a = mgr.create("", TunOptions::default()).unwrap();
        let b = mgr.create("", TunOptions::default()).unwrap();
        assert_eq!(a, "tun0");
        assert_eq!(b, "tun1");
        mgr.close_all().await;
    }

    #[tokio::test]
    async fn duplicate_tag_is_rejected_until_removed() {
        let mgr = manager();
        mgr.create("wan", TunOptions::default()).unwrap();
        assert!(matches!(
            mgr.create("wan", TunOptions::default()),
            Err(Error::AlreadyExists(_))
        ));

        mgr.remove("wan").await.unwrap();
        assert!(mgr.create("wan", TunOptions::default()).is_ok());
        mgr.close_all().await;
    }

    #[tokio::test]
    async fn polling_preset_arms_the_slot() {
        let mgr = manager();
        let opts = TunOptions {
            mode: DeliveryMode::Polling,
            ..Default::default()
        };
        mgr.create("poll", opts).unwrap();
        assert!(mgr.read_packet("poll").unwrap().is_none());

        // Default interfaces stay unset, so reads conflict.
        mgr.create("unset", TunOptions::default()).unwrap();
        assert!(matches!(
            mgr.read_packet("unset"),
            Err(Error::ModeConflict(_))
        ));
        mgr.close_all().await;
    }

    #[tokio::test]
    async fn descriptor_is_reported() {
        let mgr = manager();
        mgr.create_from_fd("fd0", 7, TunOptions::default()).unwrap();
        let info = mgr.info("fd0").unwrap();
        assert!(info.has_descriptor);
        assert!(info.binding.is_none());
        mgr.close_all().await;
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let mgr = manager();
        assert!(matches!(mgr.remove("ghost").await, Err(Error::NotFound(_))));
    }
}
