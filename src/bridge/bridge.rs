//! Packet bridge
//!
//! Turns the packet-level interface the host sees into per-flow byte streams
//! dialed through the bound instance. Ingress packets feed a userspace
//! TCP/IP stack; each accepted stream gets its own relay task; packets the
//! stack emits go back to the host through the interface's delivery slot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::engine::{DatagramChannel, Dialer};
use crate::instance::{DialerAdapter, InstanceId};
use crate::stats::TrafficStats;
use crate::tun::delivery::DeliverySlot;

use super::channel::StackChannel;
use super::config::{
    udp_timeout_for_port, EGRESS_CHANNEL_SIZE, FLOW_CLEANUP_INTERVAL, INGRESS_CHANNEL_SIZE,
    MAX_FLOWS, RELAY_BUFFER_SIZE, TCP_IDLE_TIMEOUT, UDP_IDLE_TIMEOUT,
};
use super::flow::{FlowEntry, FlowKey, FlowState, FlowTable};
use super::packet::{parse_packet, ParsedPacket};

/// Per-interface packet and flow counters
///
/// Relaxed atomics; counters are diagnostics, not billing.
#[derive(Debug, Default)]
pub struct BridgeCounters {
    /// Packets the host wrote into the interface
    pub packets_in: AtomicU64,
    /// Packets the stack emitted back toward the host
    pub packets_out: AtomicU64,
    /// Ingress packets that failed header parsing
    pub malformed: AtomicU64,
    /// ICMP and other non-TCP/UDP ingress packets
    pub ignored: AtomicU64,
    /// Ingress packets arriving while no dialer was bound
    pub unrouted: AtomicU64,
    /// Ingress packets dropped because the stack queue was full
    pub dropped: AtomicU64,
    /// Flows accepted and handed to a relay task
    pub flows_opened: AtomicU64,
    /// Flows that never reached the relay stage
    pub flows_failed: AtomicU64,
}

impl BridgeCounters {
    pub fn snapshot(&self) -> BridgeCountersSnapshot {
        BridgeCountersSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flows_opened: self.flows_opened.load(Ordering::Relaxed),
            flows_failed: self.flows_failed.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`BridgeCounters`]
#[derive(Debug, Clone, serde::Serialize)]
pub struct BridgeCountersSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub malformed: u64,
    pub ignored: u64,
    pub unrouted: u64,
    pub dropped: u64,
    pub flows_opened: u64,
    pub flows_failed: u64,
}

/// Packet bridge backing one virtual interface
pub struct PacketBridge {
    tag: String,
    mtu: u16,
    /// Current dialer binding; flows in progress keep the adapter they
    /// started with, only new flows see a rebind
    binding: Arc<ArcSwapOption<DialerAdapter>>,
    flows: Arc<FlowTable>,
    counters: Arc<BridgeCounters>,
    delivery: Arc<DeliverySlot>,
    stats: Arc<TrafficStats>,
    ingress_tx: mpsc::Sender<BytesMut>,
    ingress_rx: parking_lot::Mutex<Option<mpsc::Receiver<BytesMut>>>,
    running: Arc<AtomicBool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PacketBridge {
    pub fn new(
        tag: String,
        mtu: u16,
        delivery: Arc<DeliverySlot>,
        stats: Arc<TrafficStats>,
    ) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CHANNEL_SIZE);
        Self {
            tag,
            mtu,
            binding: Arc::new(ArcSwapOption::empty()),
            flows: Arc::new(FlowTable::new(MAX_FLOWS)),
            counters: Arc::new(BridgeCounters::default()),
            delivery,
            stats,
            ingress_tx,
            ingress_rx: parking_lot::Mutex::new(Some(ingress_rx)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Start the stack and its worker tasks
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut ingress_rx) = self.ingress_rx.lock().take() else {
            return;
        };

        let (stack_channel, stack_tx, mut stack_rx) =
            StackChannel::create_pair(INGRESS_CHANNEL_SIZE, EGRESS_CHANNEL_SIZE);

        let mut stack_config = ipstack::IpStackConfig::default();
        stack_config.mtu(self.mtu);
        let mut stack = ipstack::IpStack::new(stack_config, stack_channel);

        info!(tag = %self.tag, mtu = self.mtu, "packet bridge starting");

        let mut tasks = self.tasks.lock();

        // Ingress: host packets into the stack.
        let running = Arc::clone(&self.running);
        tasks.push(tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match ingress_rx.recv().await {
                    Some(packet) => {
                        trace!(len = packet.len(), "packet to stack");
                        if stack_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            debug!("ingress forwarder stopped");
        }));

        // Egress: stack packets back to the host via the delivery slot.
        let running = Arc::clone(&self.running);
        let counters = Arc::clone(&self.counters);
        let flows = Arc::clone(&self.flows);
        let delivery = Arc::clone(&self.delivery);
        tasks.push(tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match stack_rx.recv().await {
                    Some(packet) => {
                        counters.packets_out.fetch_add(1, Ordering::Relaxed);
                        if let Some(ParsedPacket::Flow(key)) = parse_packet(&packet) {
                            flows.touch_reply(&key);
                        }
                        delivery.deliver(packet);
                    }
                    None => break,
                }
            }
            debug!("egress router stopped");
        }));

        // Accept loop: one relay task per flow the stack hands us.
        let running = Arc::clone(&self.running);
        let counters = Arc::clone(&self.counters);
        let flows = Arc::clone(&self.flows);
        let stats = Arc::clone(&self.stats);
        let binding = Arc::clone(&self.binding);
        let tag = self.tag.clone();
        tasks.push(tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match stack.accept().await {
                    Ok(stream) => Self::dispatch_stream(
                        stream,
                        &binding,
                        &flows,
                        &counters,
                        &stats,
                    ),
                    Err(e) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(tag = %tag, error = ?e, "stack accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
            debug!("accept loop stopped");
        }));

        // Cleanup: reclaim idle flows.
        let running = Arc::clone(&self.running);
        let flows = Arc::clone(&self.flows);
        let stats = Arc::clone(&self.stats);
        let tag = self.tag.clone();
        tasks.push(tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(FLOW_CLEANUP_INTERVAL).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let removed = flows.remove_idle(TCP_IDLE_TIMEOUT, UDP_IDLE_TIMEOUT);
                for _ in 0..removed {
                    stats.flow_closed();
                }
                if removed > 0 {
                    info!(tag = %tag, removed, active = flows.len(), "reclaimed idle flows");
                }
            }
            debug!("flow cleanup stopped");
        }));
    }

    /// Feed one host packet into the interface
    ///
    /// Never fails and never blocks; packets that cannot be handled bump a
    /// counter instead.
    pub fn write_packet(&self, packet: &[u8]) {
        self.counters.packets_in.fetch_add(1, Ordering::Relaxed);

        match parse_packet(packet) {
            None => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Some(ParsedPacket::Icmp | ParsedPacket::Other(_)) => {
                self.counters.ignored.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Some(ParsedPacket::Flow(key)) => {
                if self.binding.load().is_none() {
                    self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.flows.touch(&key);
            }
        }

        if self.ingress_tx.try_send(BytesMut::from(packet)).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dispatch_stream(
        stream: ipstack::stream::IpStackStream,
        binding: &ArcSwapOption<DialerAdapter>,
        flows: &Arc<FlowTable>,
        counters: &Arc<BridgeCounters>,
        stats: &Arc<TrafficStats>,
    ) {
        match stream {
            ipstack::stream::IpStackStream::Tcp(tcp) => {
                let key = FlowKey::tcp(tcp.local_addr(), tcp.peer_addr());
                let Some(adapter) = binding.load_full() else {
                    counters.flows_failed.fetch_add(1, Ordering::Relaxed);
                    debug!(flow = %key, "tcp flow with no binding");
                    return;
                };
                let Some(entry) = flows.register(key.clone(), adapter.instance_id().clone())
                else {
                    // Live duplicate or table full; the stream drops here and
                    // the stack's retransmit handling covers the rest.
                    return;
                };
                counters.flows_opened.fetch_add(1, Ordering::Relaxed);
                stats.flow_opened();

                let handle = tokio::spawn(Self::handle_tcp_flow(
                    tcp,
                    Arc::clone(&entry),
                    adapter,
                    Arc::clone(flows),
                    Arc::clone(counters),
                    Arc::clone(stats),
                ));
                entry.set_abort(handle.abort_handle());
            }
            ipstack::stream::IpStackStream::Udp(udp) => {
                let key = FlowKey::udp(udp.local_addr(), udp.peer_addr());
                let Some(adapter) = binding.load_full() else {
                    counters.flows_failed.fetch_add(1, Ordering::Relaxed);
                    debug!(flow = %key, "udp flow with no binding");
                    return;
                };
                let Some(entry) = flows.register(key.clone(), adapter.instance_id().clone())
                else {
                    return;
                };
                counters.flows_opened.fetch_add(1, Ordering::Relaxed);
                stats.flow_opened();

                let handle = tokio::spawn(Self::handle_udp_flow(
                    udp,
                    Arc::clone(&entry),
                    adapter,
                    Arc::clone(flows),
                    Arc::clone(counters),
                    Arc::clone(stats),
                ));
                entry.set_abort(handle.abort_handle());
            }
            ipstack::stream::IpStackStream::UnknownTransport(u) => {
                trace!(src = %u.src_addr(), dst = %u.dst_addr(), "unknown transport");
            }
            ipstack::stream::IpStackStream::UnknownNetwork(p) => {
                trace!(len = p.len(), "unknown network packet");
            }
        }
    }

    async fn handle_tcp_flow(
        mut tcp: ipstack::stream::IpStackTcpStream,
        entry: Arc<FlowEntry>,
        adapter: Arc<DialerAdapter>,
        flows: Arc<FlowTable>,
        counters: Arc<BridgeCounters>,
        stats: Arc<TrafficStats>,
    ) {
        let dst = entry.key.dst_addr;
        let mut upstream = match adapter
            .dial_stream(dst, std::time::Duration::ZERO)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                debug!(flow = %entry.key, error = %e, "tcp dial failed");
                counters.flows_failed.fetch_add(1, Ordering::Relaxed);
                if flows.remove(&entry.key).is_some() {
                    stats.flow_closed();
                }
                return;
            }
        };

        entry.set_state(FlowState::Established);
        debug!(flow = %entry.key, "tcp flow established");

        match relay_streams(&mut tcp, &mut upstream, &entry, &stats).await {
            Ok((up, down)) => {
                debug!(flow = %entry.key, up, down, "tcp flow completed");
            }
            Err(e) => {
                // Resets and half-closes are routine on this path.
                debug!(flow = %entry.key, error = %e, "tcp flow ended with error");
            }
        }

        entry.set_state(FlowState::Closed);
        if flows.remove(&entry.key).is_some() {
            stats.flow_closed();
        }
    }

    async fn handle_udp_flow(
        mut udp: ipstack::stream::IpStackUdpStream,
        entry: Arc<FlowEntry>,
        adapter: Arc<DialerAdapter>,
        flows: Arc<FlowTable>,
        counters: Arc<BridgeCounters>,
        stats: Arc<TrafficStats>,
    ) {
        let dst = entry.key.dst_addr;
        let upstream = match adapter
            .dial_datagram(dst, std::time::Duration::ZERO)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                debug!(flow = %entry.key, error = %e, "udp dial failed");
                counters.flows_failed.fetch_add(1, Ordering::Relaxed);
                if flows.remove(&entry.key).is_some() {
                    stats.flow_closed();
                }
                return;
            }
        };

        entry.set_state(FlowState::Established);
        let idle = udp_timeout_for_port(dst.port());

        let mut up_buf = vec![0u8; 65535];
        let mut down_buf = vec![0u8; 65535];

        loop {
            tokio::select! {
                result = udp.read(&mut up_buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            entry.touch();
                            entry.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
                            stats.add_uplink(n as u64);
                            if let Err(e) = upstream.send(&up_buf[..n]).await {
                                debug!(flow = %entry.key, error = %e, "udp send failed");
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(flow = %entry.key, error = %e, "udp read failed");
                            break;
                        }
                    }
                }
                result = upstream.recv(&mut down_buf) => {
                    match result {
                        Ok(n) => {
                            entry.touch();
                            entry.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
                            stats.add_downlink(n as u64);
                            if let Err(e) = udp.write_all(&down_buf[..n]).await {
                                debug!(flow = %entry.key, error = %e, "udp write failed");
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(flow = %entry.key, error = %e, "udp recv failed");
                            break;
                        }
                    }
                }
                () = tokio::time::sleep(idle) => {
                    debug!(flow = %entry.key, "udp flow idle timeout");
                    break;
                }
            }
        }

        entry.set_state(FlowState::Closed);
        if flows.remove(&entry.key).is_some() {
            stats.flow_closed();
        }
    }

    /// Stop the stack and abort every worker and relay task
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(
            tag = %self.tag,
            flows = self.flows.len(),
            "packet bridge stopping"
        );

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        let removed = self.flows.clear_all();
        for _ in 0..removed {
            self.stats.flow_closed();
        }
    }

    /// Replace the dialer binding; `None` unbinds
    ///
    /// Existing flows drain on the adapter they started with.
    pub fn bind(&self, adapter: Option<Arc<DialerAdapter>>) {
        match &adapter {
            Some(a) => info!(
                tag = %self.tag,
                instance = %a.instance_id(),
                outbound = a.outbound_tag(),
                "interface bound"
            ),
            None => info!(tag = %self.tag, "interface unbound"),
        }
        self.binding.store(adapter);
    }

    pub fn binding(&self) -> Option<Arc<DialerAdapter>> {
        self.binding.load_full()
    }

    /// Abort every flow dialed through `instance_id`
    pub fn cancel_flows_for_instance(&self, instance_id: &InstanceId) -> usize {
        let removed = self.flows.remove_for_instance(instance_id);
        for _ in 0..removed {
            self.stats.flow_closed();
        }
        if removed > 0 {
            info!(tag = %self.tag, instance = %instance_id, removed, "flows cancelled");
        }
        removed
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn counters(&self) -> BridgeCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Bidirectional relay with explicit buffers and per-direction accounting
async fn relay_streams<A, B>(
    local: &mut A,
    upstream: &mut B,
    entry: &FlowEntry,
    stats: &TrafficStats,
) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (mut local_r, mut local_w) = tokio::io::split(local);
    let (mut up_r, mut up_w) = tokio::io::split(upstream);

    let uplink = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = local_r.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            up_w.write_all(&buf[..n]).await?;
            entry.touch();
            entry.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
            stats.add_uplink(n as u64);
            total += n as u64;
        }
        up_w.shutdown().await?;
        Ok::<_, std::io::Error>(total)
    };

    let downlink = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = up_r.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            local_w.write_all(&buf[..n]).await?;
            entry.touch();
            entry.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
            stats.add_downlink(n as u64);
            total += n as u64;
        }
        local_w.shutdown().await?;
        Ok::<_, std::io::Error>(total)
    };

    let (up, down) = tokio::join!(uplink, downlink);
    match (up, down) {
        (Ok(u), Ok(d)) => Ok((u, d)),
        (Ok(u), Err(_)) => Ok((u, 0)),
        (Err(_), Ok(d)) => Ok((0, d)),
        (Err(e), Err(_)) => Err(e),
    }
}
