//! Egress packet delivery
//!
//! Each interface delivers the packets its stack emits through exactly one
//! of two mutually exclusive modes: a push callback or a pull ring the host
//! polls. The slot starts unset; switching between modes requires clearing
//! the current one first. A stalled consumer never blocks the stack, the
//! packet is dropped and counted instead.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Delivery mode of one interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Unset,
    Callback,
    Polling,
}

/// Host callback invoked once per egress packet
pub type PacketHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

enum ModeInner {
    Unset,
    Callback {
        tx: mpsc::Sender<BytesMut>,
        dispatcher: JoinHandle<()>,
    },
    Polling {
        ring: VecDeque<BytesMut>,
    },
}

/// Serializable view of a delivery slot
#[derive(Debug, Clone, Serialize)]
pub struct DeliverySnapshot {
    pub mode: DeliveryMode,
    /// Packets waiting in the polling ring, zero in other modes
    pub buffered: usize,
    /// Packets dropped because no consumer kept up (or none was set)
    pub dropped: u64,
}

/// Per-interface egress delivery state
pub struct DeliverySlot {
    inner: Mutex<ModeInner>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl DeliverySlot {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ModeInner::Unset),
            dropped: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Install a callback; fails unless the slot is unset
    pub fn set_callback(&self, handler: PacketHandler) -> Result<()> {
        let mut inner = self.inner.lock();
        match *inner {
            ModeInner::Unset => {}
            ModeInner::Callback { .. } => {
                return Err(Error::mode_conflict(
                    "callback already set, clear it before replacing",
                ))
            }
            ModeInner::Polling { .. } => {
                return Err(Error::mode_conflict("interface is in polling mode"))
            }
        }

        // The dispatcher decouples handler execution from the stack's egress
        // task; a slow handler fills this queue and overflow is dropped. A
        // panicking handler drops its packet, the dispatcher stays up.
        let (tx, mut rx) = mpsc::channel::<BytesMut>(self.capacity);
        let dropped = Arc::clone(&self.dropped);
        let dispatcher = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if panic::catch_unwind(AssertUnwindSafe(|| handler(&packet))).is_err() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("egress callback panicked, packet dropped");
                }
            }
        });
        *inner = ModeInner::Callback { tx, dispatcher };
        Ok(())
    }

    /// Switch the slot to polling; idempotent, fails while a callback is set
    pub fn enable_polling(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match *inner {
            ModeInner::Unset => {
                *inner = ModeInner::Polling {
                    ring: VecDeque::with_capacity(self.capacity),
                };
                Ok(())
            }
            ModeInner::Polling { .. } => Ok(()),
            ModeInner::Callback { .. } => {
                Err(Error::mode_conflict("interface is in callback mode"))
            }
        }
    }

    /// Reset the slot to unset, discarding any buffered packets
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if let ModeInner::Callback { dispatcher, .. } = &*inner {
            dispatcher.abort();
        }
        *inner = ModeInner::Unset;
    }

    /// Hand one egress packet to the configured consumer
    ///
    /// Never blocks. Packets that cannot be accepted are dropped and
    /// counted; in polling mode the oldest buffered packet gives way.
    pub fn deliver(&self, packet: BytesMut) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            ModeInner::Unset => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            ModeInner::Callback { tx, .. } => {
                if tx.try_send(packet).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("callback queue full, packet dropped");
                }
            }
            ModeInner::Polling { ring } => {
                if ring.len() >= self.capacity {
                    ring.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                ring.push_back(packet);
            }
        }
    }

    /// Pop the oldest buffered packet; only valid in polling mode
    pub fn read(&self) -> Result<Option<BytesMut>> {
        let mut inner = self.inner.lock();
        match &mut *inner {
            ModeInner::Polling { ring } => Ok(ring.pop_front()),
            _ => Err(Error::mode_conflict("interface is not in polling mode")),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        match *self.inner.lock() {
            ModeInner::Unset => DeliveryMode::Unset,
            ModeInner::Callback { .. } => DeliveryMode::Callback,
            ModeInner::Polling { .. } => DeliveryMode::Polling,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        let inner = self.inner.lock();
        let (mode, buffered) = match &*inner {
            ModeInner::Unset => (DeliveryMode::Unset, 0),
            ModeInner::Callback { .. } => (DeliveryMode::Callback, 0),
            ModeInner::Polling { ring } => (DeliveryMode::Polling, ring.len()),
        };
        DeliverySnapshot {
            mode,
            buffered,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DeliverySlot {
    fn drop(&mut self) {
        if let ModeInner::Callback { dispatcher, .. } = &*self.inner.lock() {
            dispatcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn modes_are_mutually_exclusive() {
        let slot = DeliverySlot::new(8);
        assert_eq!(slot.mode(), DeliveryMode::Unset);
        assert!(slot.read().is_err());

        slot.enable_polling().unwrap();
        slot.enable_polling().unwrap();
        assert!(slot.set_callback(Arc::new(|_| {})).is_err());

        slot.clear();
        slot.set_callback(Arc::new(|_| {})).unwrap();
        assert!(slot.enable_polling().is_err());
        assert!(slot.set_callback(Arc::new(|_| {})).is_err());

        slot.clear();
        assert_eq!(slot.mode(), DeliveryMode::Unset);
    }

    #[tokio::test]
    async fn polling_ring_drops_oldest_on_overflow() {
        let slot = DeliverySlot::new(3);
        slot.enable_polling().unwrap();

        for i in 0u8..5 {
            slot.deliver(BytesMut::from(&[i][..]));
        }
        // Capacity 3, 5 delivered: packets 0 and 1 were displaced.
        assert_eq!(slot.dropped(), 2);
        assert_eq!(slot.read().unwrap().unwrap()[0], 2);
        assert_eq!(slot.read().unwrap().unwrap()[0], 3);
        assert_eq!(slot.read().unwrap().unwrap()[0], 4);
        assert!(slot.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn callback_receives_packets() {
        let slot = DeliverySlot::new(8);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        slot.set_callback(Arc::new(move |pkt| {
            assert_eq!(pkt, b"abc");
            seen.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        slot.deliver(BytesMut::from(&b"abc"[..]));
        slot.deliver(BytesMut::from(&b"abc"[..]));

        // Dispatcher runs on its own task.
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_callback_does_not_kill_delivery() {
        let slot = DeliverySlot::new(8);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        slot.set_callback(Arc::new(move |pkt| {
            assert!(pkt != b"boom", "bad packet");
            seen.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        slot.deliver(BytesMut::from(&b"boom"[..]));
        slot.deliver(BytesMut::from(&b"ok"[..]));
        slot.deliver(BytesMut::from(&b"ok"[..]));

        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(slot.mode(), DeliveryMode::Callback);
        assert_eq!(slot.dropped(), 1);
    }

    #[tokio::test]
    async fn unset_slot_counts_drops() {
        let slot = DeliverySlot::new(8);
        slot.deliver(BytesMut::from(&b"x"[..]));
        assert_eq!(slot.dropped(), 1);
    }
}
