//! Runtime facade
//!
//! `Runtime` ties the subsystems together behind the surface a host process
//! drives: instance lifecycle, virtual interfaces, bindings, failover, and
//! global traffic stats. It is cheap to share; all state lives behind `Arc`s.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::info;

use crate::engine::{DirectEngine, ProxyEngine};
use crate::error::{Error, Result};
use crate::failover::{
    FailoverConfig, FailoverController, FailoverServer, FailoverState, TcpProbe,
};
use crate::instance::{DialerAdapter, InstanceId, InstanceInfo, InstanceRegistry, InstanceState};
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::tun::{PacketHandler, TunInfo, TunManager, TunOptions};

pub struct Runtime {
    registry: Arc<InstanceRegistry>,
    tun: Arc<TunManager>,
    stats: Arc<TrafficStats>,
    failover: parking_lot::Mutex<Option<Arc<FailoverController>>>,
}

impl Runtime {
    pub fn new(engine: Arc<dyn ProxyEngine>) -> Self {
        let stats = Arc::new(TrafficStats::new());
        Self {
            registry: Arc::new(InstanceRegistry::new(engine)),
            tun: Arc::new(TunManager::new(Arc::clone(&stats))),
            stats,
            failover: parking_lot::Mutex::new(None),
        }
    }

    /// Runtime backed by the built-in direct engine
    #[must_use]
    pub fn with_direct_engine() -> Self {
        Self::new(Arc::new(DirectEngine::new()))
    }

    // ---- instances ----

    pub fn create_instance(&self, config: &str) -> Result<InstanceId> {
        self.registry.create(config)
    }

    pub async fn start_instance(&self, id: &InstanceId) -> Result<()> {
        self.registry.start(id).await
    }

    /// Stop an instance, aborting its flows on every interface first
    pub async fn stop_instance(&self, id: &InstanceId) -> Result<()> {
        self.tun.cancel_flows_for_instance(id);
        self.registry.stop(id).await
    }

    /// Destroy an instance, aborting its flows on every interface first
    pub async fn destroy_instance(&self, id: &InstanceId) -> Result<()> {
        self.tun.cancel_flows_for_instance(id);
        self.registry.destroy(id).await
    }

    pub fn instance_state(&self, id: &InstanceId) -> Result<InstanceState> {
        self.registry.state(id)
    }

    pub fn instance_info(&self, id: &InstanceId) -> Result<InstanceInfo> {
        self.registry.info(id)
    }

    pub fn list_instances(&self) -> Vec<InstanceInfo> {
        self.registry.list()
    }

    // ---- interfaces ----

    pub fn create_tun(&self, tag: &str, options: TunOptions) -> Result<String> {
        self.tun.create(tag, options)
    }

    pub fn create_tun_from_fd(&self, tag: &str, fd: i32, options: TunOptions) -> Result<String> {
        self.tun.create_from_fd(tag, fd, options)
    }

    pub async fn remove_tun(&self, tag: &str) -> Result<()> {
        self.tun.remove(tag).await
    }

    pub fn tun_info(&self, tag: &str) -> Result<TunInfo> {
        self.tun.info(tag)
    }

    pub fn list_tuns(&self) -> Vec<TunInfo> {
        self.tun.list()
    }

    /// Bind an interface to one outbound of a registered instance
    ///
    /// The instance must exist but does not have to be running yet; dials
    /// fail until it is.
    pub fn bind_dialer(&self, tag: &str, instance_id: &InstanceId, outbound_tag: &str) -> Result<()> {
        if !self.registry.contains(instance_id) {
            return Err(Error::not_found(format!("instance {instance_id}")));
        }
        let adapter = Arc::new(DialerAdapter::new(
            Arc::clone(&self.registry),
            instance_id.clone(),
            outbound_tag,
        ));
        self.tun.bind_dialer(tag, Some(adapter))
    }

    pub fn unbind_dialer(&self, tag: &str) -> Result<()> {
        self.tun.bind_dialer(tag, None)
    }

    pub fn write_packet(&self, tag: &str, packet: &[u8]) -> Result<()> {
        self.tun.write_packet(tag, packet)
    }

    pub fn read_packet(&self, tag: &str) -> Result<Option<BytesMut>> {
        self.tun.read_packet(tag)
    }

    pub fn set_output_callback(&self, tag: &str, handler: PacketHandler) -> Result<()> {
        self.tun.set_output_callback(tag, handler)
    }

    pub fn clear_output(&self, tag: &str) -> Result<()> {
        self.tun.clear_output(tag)
    }

    pub fn enable_polling(&self, tag: &str) -> Result<()> {
        self.tun.enable_polling(tag)
    }

    // ---- failover ----

    /// Install a failover group, replacing any previous one
    ///
    /// When a switch lands on a server that names an instance, every bound
    /// interface is rebound to that instance's outbound.
    pub fn setup_failover(
        &self,
        servers: Vec<FailoverServer>,
        config: FailoverConfig,
    ) -> Result<()> {
        let controller = Arc::new(FailoverController::new(
            servers,
            config,
            Arc::new(TcpProbe),
        )?);

        let registry = Arc::clone(&self.registry);
        let tun = Arc::clone(&self.tun);
        controller.set_switch_hook(Arc::new(move |_, server| {
            let Some(instance_id) = server.instance_id.as_deref() else {
                return;
            };
            let instance_id: InstanceId = instance_id.into();
            if !registry.contains(&instance_id) {
                info!(instance = %instance_id, "switch target instance unknown, skipping rebind");
                return;
            }
            let adapter = Arc::new(DialerAdapter::new(
                Arc::clone(&registry),
                instance_id,
                server.outbound_tag.clone(),
            ));
            let rebound = tun.rebind_all(&adapter);
            info!(server = %server.name, rebound, "interfaces rebound after failover");
        }));

        let previous = self.failover.lock().replace(controller);
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    pub fn start_failover(&self) -> Result<()> {
        self.controller()?.start();
        Ok(())
    }

    pub fn stop_failover(&self) -> Result<()> {
        self.controller()?.stop();
        Ok(())
    }

    pub fn current_server(&self) -> Result<FailoverServer> {
        Ok(self.controller()?.current_server())
    }

    pub fn switch_server(&self, index: usize) -> Result<()> {
        self.controller()?.switch_server(index)
    }

    pub fn failover_state(&self) -> Result<FailoverState> {
        Ok(self.controller()?.state())
    }

    fn controller(&self) -> Result<Arc<FailoverController>> {
        self.failover
            .lock()
            .clone()
            .ok_or_else(|| Error::not_found("failover is not configured"))
    }

    // ---- stats and shutdown ----

    pub fn traffic_stats(&self) -> TrafficSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Tear everything down: failover, interfaces, then instances
    pub async fn close_all(&self) {
        if let Some(controller) = self.failover.lock().take() {
            controller.stop();
        }
        self.tun.close_all().await;
        self.registry.stop_all().await;
        info!("runtime closed");
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::with_direct_engine()
    }
}
