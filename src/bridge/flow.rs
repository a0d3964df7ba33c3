//! Flow tracking
//!
//! One interface tracks its live flows in a `DashMap` keyed by the packet
//! 3-tuple (source, destination, protocol). Retransmitted handshake packets
//! must map onto the existing flow, so registration deduplicates on the key
//! and only the relay task for a flow removes it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::instance::InstanceId;

use super::packet::{PROTO_TCP, PROTO_UDP};

/// Key identifying one flow on an interface
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct FlowKey {
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
    /// IP protocol number, 6 or 17
    pub protocol: u8,
}

impl FlowKey {
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            src_addr: src,
            dst_addr: dst,
            protocol: PROTO_TCP,
        }
    }

    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            src_addr: src,
            dst_addr: dst,
            protocol: PROTO_UDP,
        }
    }

    /// Key with source and destination swapped, for reply packets
    #[must_use]
    pub fn reverse(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            protocol: self.protocol,
        }
    }

    #[inline]
    pub fn is_tcp(&self) -> bool {
        self.protocol == PROTO_TCP
    }

    #[inline]
    pub fn is_udp(&self) -> bool {
        self.protocol == PROTO_UDP
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            PROTO_TCP => "tcp",
            PROTO_UDP => "udp",
            n => return write!(f, "proto={} {} -> {}", n, self.src_addr, self.dst_addr),
        };
        write!(f, "{} {} -> {}", proto, self.src_addr, self.dst_addr)
    }
}

const STATE_OPENING: u8 = 0;
const STATE_ESTABLISHED: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Relay state of one flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Opening,
    Established,
    Closing,
    Closed,
}

impl FlowState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Opening => STATE_OPENING,
            Self::Established => STATE_ESTABLISHED,
            Self::Closing => STATE_CLOSING,
            Self::Closed => STATE_CLOSED,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPENING => Self::Opening,
            STATE_ESTABLISHED => Self::Established,
            STATE_CLOSING => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Metadata for one live flow
#[derive(Debug)]
pub struct FlowEntry {
    pub id: u64,
    pub key: FlowKey,
    /// Instance the flow was dialed through
    pub instance_id: InstanceId,
    pub opened_at: Instant,
    last_active: parking_lot::Mutex<Instant>,
    state: AtomicU8,
    /// Handle to the relay task, set after spawn
    abort: parking_lot::Mutex<Option<AbortHandle>>,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
}

impl FlowEntry {
    fn new(id: u64, key: FlowKey, instance_id: InstanceId) -> Self {
        let now = Instant::now();
        Self {
            id,
            key,
            instance_id,
            opened_at: now,
            last_active: parking_lot::Mutex::new(now),
            state: AtomicU8::new(STATE_OPENING),
            abort: parking_lot::Mutex::new(None),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_time(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn state(&self) -> FlowState {
        FlowState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: FlowState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn set_abort(&self, handle: AbortHandle) {
        *self.abort.lock() = Some(handle);
    }

    /// Abort the relay task if one is attached
    pub fn abort(&self) {
        if let Some(handle) = self.abort.lock().take() {
            handle.abort();
        }
        self.set_state(FlowState::Closed);
    }
}

/// Flow table for one interface
pub struct FlowTable {
    flows: DashMap<FlowKey, Arc<FlowEntry>>,
    next_id: AtomicU64,
    max_flows: usize,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Self {
        Self {
            flows: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_flows,
        }
    }

    /// Register a new flow
    ///
    /// Returns `None` when the key already maps to a live flow (the existing
    /// entry is touched instead) or the table is at capacity.
    pub fn register(&self, key: FlowKey, instance_id: InstanceId) -> Option<Arc<FlowEntry>> {
        if let Some(existing) = self.flows.get(&key) {
            existing.touch();
            return None;
        }
        if self.flows.len() >= self.max_flows {
            debug!(limit = self.max_flows, "flow table full");
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(FlowEntry::new(id, key.clone(), instance_id));
        self.flows.insert(key, Arc::clone(&entry));
        Some(entry)
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<FlowEntry>> {
        self.flows.remove(key).map(|(_, entry)| entry)
    }

    /// Refresh the activity timestamp of a live flow, if present
    pub fn touch(&self, key: &FlowKey) {
        if let Some(entry) = self.flows.get(key) {
            entry.touch();
        }
    }

    /// Refresh the activity timestamp for the flow a reply packet belongs to
    ///
    /// `reply_key` is the key as seen in the egress packet; the live entry is
    /// keyed by its reverse.
    pub fn touch_reply(&self, reply_key: &FlowKey) {
        if let Some(entry) = self.flows.get(&reply_key.reverse()) {
            entry.touch();
        }
    }

    /// Abort and drop every flow idle past its protocol's timeout
    pub fn remove_idle(&self, tcp_timeout: Duration, udp_timeout: Duration) -> usize {
        let mut removed = 0;
        self.flows.retain(|key, entry| {
            let timeout = if key.is_tcp() { tcp_timeout } else { udp_timeout };
            if entry.idle_time() > timeout {
                entry.abort();
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Abort and drop every flow dialed through `instance_id`
    pub fn remove_for_instance(&self, instance_id: &InstanceId) -> usize {
        let mut removed = 0;
        self.flows.retain(|_, entry| {
            if entry.instance_id == *instance_id {
                entry.abort();
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Abort and drop every flow
    pub fn clear_all(&self) -> usize {
        let mut removed = 0;
        self.flows.retain(|_, entry| {
            entry.abort();
            removed += 1;
            false
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn tcp_count(&self) -> usize {
        self.flows.iter().filter(|e| e.key().is_tcp()).count()
    }

    pub fn udp_count(&self) -> usize {
        self.flows.iter().filter(|e| e.key().is_udp()).count()
    }
}
