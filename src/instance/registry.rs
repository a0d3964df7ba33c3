//! Instance registry
//!
//! Lifecycle operations on the same instance go through a per-entry async
//! mutex that also owns the engine handle. `start` uses `try_lock` so a
//! caller racing an in-flight transition gets `Busy` immediately; `stop` and
//! `destroy` queue behind the current operation instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::engine::{Dialer, EngineInstance, ProxyEngine, DEFAULT_OUTBOUND_TAG};
use crate::error::{Error, Result};

use super::{InstanceId, InstanceInfo, InstanceState};

struct Shared {
    state: InstanceState,
    started_at: Option<Instant>,
    started_at_unix: Option<u64>,
    dialers: HashMap<String, Arc<dyn Dialer>>,
}

struct InstanceEntry {
    id: InstanceId,
    config: String,
    shared: RwLock<Shared>,
    /// Serializes lifecycle transitions and owns the live engine handle
    op: tokio::sync::Mutex<Option<Box<dyn EngineInstance>>>,
}

impl InstanceEntry {
    fn new(id: InstanceId, config: String) -> Self {
        Self {
            id,
            config,
            shared: RwLock::new(Shared {
                state: InstanceState::Created,
                started_at: None,
                started_at_unix: None,
                dialers: HashMap::new(),
            }),
            op: tokio::sync::Mutex::new(None),
        }
    }

    fn set_state(&self, state: InstanceState) {
        self.shared.write().state = state;
    }
}

/// Registry of engine instances keyed by [`InstanceId`]
pub struct InstanceRegistry {
    engine: Arc<dyn ProxyEngine>,
    entries: DashMap<InstanceId, Arc<InstanceEntry>>,
}

impl InstanceRegistry {
    pub fn new(engine: Arc<dyn ProxyEngine>) -> Self {
        Self {
            engine,
            entries: DashMap::new(),
        }
    }

    /// Validate a configuration and register a new instance in `Created`
    pub fn create(&self, config: &str) -> Result<InstanceId> {
        self.engine.validate(config)?;

        let id = InstanceId::generate();
        let entry = Arc::new(InstanceEntry::new(id.clone(), config.to_string()));
        self.entries.insert(id.clone(), entry);
        info!(instance = %id, "instance created");
        Ok(id)
    }

    /// Start an instance; idempotent when already running
    pub async fn start(&self, id: &InstanceId) -> Result<()> {
        let entry = self.entry(id)?;

        let mut guard = entry
            .op
            .try_lock()
            .map_err(|_| Error::busy(format!("instance {id} has an operation in flight")))?;

        if entry.shared.read().state == InstanceState::Running {
            debug!(instance = %id, "start on running instance is a no-op");
            return Ok(());
        }

        entry.set_state(InstanceState::Starting);
        let handle = match self.engine.start(&entry.config).await {
            Ok(h) => h,
            Err(e) => {
                entry.set_state(InstanceState::Stopped);
                warn!(instance = %id, error = %e, "engine start failed");
                return Err(e);
            }
        };

        let mut dialers = HashMap::new();
        for tag in handle.outbound_tags() {
            if let Some(dialer) = handle.outbound(&tag) {
                dialers.insert(tag, dialer);
            }
        }

        {
            let mut shared = entry.shared.write();
            shared.dialers = dialers;
            shared.started_at = Some(Instant::now());
            shared.started_at_unix = Some(unix_now());
            shared.state = InstanceState::Running;
        }
        *guard = Some(handle);
        info!(instance = %id, "instance running");
        Ok(())
    }

    /// Stop an instance; a no-op unless currently running
    pub async fn stop(&self, id: &InstanceId) -> Result<()> {
        let entry = self.entry(id)?;
        let mut guard = entry.op.lock().await;
        Self::stop_locked(&entry, &mut guard).await;
        Ok(())
    }

    async fn stop_locked(
        entry: &Arc<InstanceEntry>,
        guard: &mut tokio::sync::MutexGuard<'_, Option<Box<dyn EngineInstance>>>,
    ) {
        if entry.shared.read().state != InstanceState::Running {
            return;
        }
        entry.set_state(InstanceState::Stopping);

        let handle = guard.take();
        {
            let mut shared = entry.shared.write();
            shared.dialers.clear();
            shared.started_at = None;
            shared.started_at_unix = None;
        }
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        entry.set_state(InstanceState::Stopped);
        info!(instance = %entry.id, "instance stopped");
    }

    /// Stop an instance if running, then remove it from the registry
    pub async fn destroy(&self, id: &InstanceId) -> Result<()> {
        let entry = self.entry(id)?;
        {
            let mut guard = entry.op.lock().await;
            Self::stop_locked(&entry, &mut guard).await;
        }
        self.entries.remove(id);
        info!(instance = %id, "instance destroyed");
        Ok(())
    }

    /// Stop every running instance
    pub async fn stop_all(&self) {
        let ids: Vec<InstanceId> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(instance = %id, error = %e, "stop during shutdown failed");
            }
        }
    }

    /// Current lifecycle state of an instance
    pub fn state(&self, id: &InstanceId) -> Result<InstanceState> {
        Ok(self.entry(id)?.shared.read().state)
    }

    /// Snapshot of one instance
    pub fn info(&self, id: &InstanceId) -> Result<InstanceInfo> {
        let entry = self.entry(id)?;
        let shared = entry.shared.read();
        Ok(InstanceInfo {
            id: entry.id.clone(),
            state: shared.state,
            uptime_seconds: shared.started_at.map(|t| t.elapsed().as_secs()),
            started_at_unix: shared.started_at_unix,
        })
    }

    /// Snapshot of every registered instance
    pub fn list(&self) -> Vec<InstanceInfo> {
        self.entries
            .iter()
            .map(|e| {
                let shared = e.shared.read();
                InstanceInfo {
                    id: e.id.clone(),
                    state: shared.state,
                    uptime_seconds: shared.started_at.map(|t| t.elapsed().as_secs()),
                    started_at_unix: shared.started_at_unix,
                }
            })
            .collect()
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.entries.contains_key(id)
    }

    /// Resolve an outbound dialer, checking liveness under one read guard
    ///
    /// An empty `tag` selects [`DEFAULT_OUTBOUND_TAG`].
    pub fn checked_dialer(&self, id: &InstanceId, tag: &str) -> Result<Arc<dyn Dialer>> {
        let entry = self.entry(id)?;
        let shared = entry.shared.read();
        if shared.state != InstanceState::Running {
            return Err(Error::InstanceNotRunning(id.to_string()));
        }
        let tag = if tag.is_empty() { DEFAULT_OUTBOUND_TAG } else { tag };
        shared
            .dialers
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::OutboundNotFound(tag.to_string()))
    }

    fn entry(&self, id: &InstanceId) -> Result<Arc<InstanceEntry>> {
        self.entries
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::not_found(format!("instance {id} not found")))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DirectEngine;

    const CONFIG: &str = r#"{"outbounds":[{"tag":"proxy","type":"direct"}]}"#;

    fn registry() -> InstanceRegistry {
        InstanceRegistry::new(Arc::new(DirectEngine::new()))
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let reg = registry();
        let id = reg.create(CONFIG).unwrap();
        assert_eq!(reg.state(&id).unwrap(), InstanceState::Created);

        reg.start(&id).await.unwrap();
        assert_eq!(reg.state(&id).unwrap(), InstanceState::Running);

        reg.stop(&id).await.unwrap();
        assert_eq!(reg.state(&id).unwrap(), InstanceState::Stopped);

        reg.start(&id).await.unwrap();
        assert_eq!(reg.state(&id).unwrap(), InstanceState::Running);

        reg.destroy(&id).await.unwrap();
        assert!(matches!(reg.state(&id), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let reg = registry();
        let id = reg.create(CONFIG).unwrap();
        reg.start(&id).await.unwrap();
        let first = reg.info(&id).unwrap().started_at_unix;
        reg.start(&id).await.unwrap();
        assert_eq!(reg.info(&id).unwrap().started_at_unix, first);
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let reg = registry();
        let id = reg.create(CONFIG).unwrap();
        reg.stop(&id).await.unwrap();
        assert_eq!(reg.state(&id).unwrap(), InstanceState::Created);
    }

    #[test]
    fn create_rejects_invalid_config() {
        let reg = registry();
        assert!(matches!(reg.create("nope"), Err(Error::ConfigInvalid(_))));
        assert_eq!(reg.list().len(), 0);
    }

    #[tokio::test]
    async fn checked_dialer_validates_liveness() {
        let reg = registry();
        let id = reg.create(CONFIG).unwrap();
        assert!(matches!(
            reg.checked_dialer(&id, "proxy"),
            Err(Error::InstanceNotRunning(_))
        ));

        reg.start(&id).await.unwrap();
        assert!(reg.checked_dialer(&id, "proxy").is_ok());
        // An empty tag falls back to the default outbound.
        assert!(reg.checked_dialer(&id, "").is_ok());
        assert!(matches!(
            reg.checked_dialer(&id, "missing"),
            Err(Error::OutboundNotFound(_))
        ));

        let other: InstanceId = "nonexistent".into();
        assert!(matches!(
            reg.checked_dialer(&other, "proxy"),
            Err(Error::NotFound(_))
        ));
    }
}
