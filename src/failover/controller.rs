//! Failover controller

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::probe::HealthProbe;
use super::{FailoverConfig, FailoverServer};

const STATE_IDLE: u8 = 0;
const STATE_MONITORING: u8 = 1;
const STATE_SWITCHING: u8 = 2;

/// State of the failover monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverState {
    Idle,
    Monitoring,
    Switching,
}

impl FailoverState {
    const fn from_u8(v: u8) -> Self {
        match v {
            STATE_MONITORING => Self::Monitoring,
            STATE_SWITCHING => Self::Switching,
            _ => Self::Idle,
        }
    }
}

/// Callback fired after the active server changes
pub type SwitchHook = Arc<dyn Fn(usize, &FailoverServer) + Send + Sync>;

struct Inner {
    servers: parking_lot::RwLock<Vec<FailoverServer>>,
    current: AtomicUsize,
    consecutive_failures: AtomicU32,
    state: AtomicU8,
    config: FailoverConfig,
    probe: Arc<dyn HealthProbe>,
    on_switch: parking_lot::RwLock<Option<SwitchHook>>,
}

impl Inner {
    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }

    fn current_server(&self) -> FailoverServer {
        let servers = self.servers.read();
        servers[self.current.load(Ordering::SeqCst).min(servers.len() - 1)].clone()
    }

    fn apply_switch(&self, index: usize, latency_ms: Option<u32>) {
        let server = {
            let mut servers = self.servers.write();
            servers[index].latency_ms = latency_ms;
            servers[index].clone()
        };
        let previous = self.current.swap(index, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        info!(
            from = previous,
            to = index,
            server = %server.name,
            latency_ms = ?latency_ms,
            "active server switched"
        );

        let hook = self.on_switch.read().clone();
        if let Some(hook) = hook {
            hook(index, &server);
        }
    }

    /// Probe every candidate and switch to the best healthy one
    async fn evaluate_candidates(&self) {
        self.set_state(STATE_SWITCHING);

        let current = self.current.load(Ordering::SeqCst);
        let candidates: Vec<(usize, FailoverServer)> = self
            .servers
            .read()
            .iter()
            .cloned()
            .enumerate()
            .filter(|(i, _)| *i != current)
            .collect();

        let mut best: Option<(usize, u32)> = None;
        for (index, server) in candidates {
            let Some(ms) = self.probe.probe(&server, self.config.probe_timeout).await else {
                debug!(server = %server.name, "candidate unreachable");
                continue;
            };
            if self.config.latency_limit_ms > 0 && ms > self.config.latency_limit_ms {
                debug!(server = %server.name, ms, "candidate over latency limit");
                continue;
            }
            // Ties keep the earlier candidate.
            if best.map_or(true, |(_, best_ms)| ms < best_ms) {
                best = Some((index, ms));
            }
        }

        match best {
            Some((index, ms)) => self.apply_switch(index, Some(ms)),
            None => {
                warn!("no eligible failover candidate, staying on current server");
                // Back off one failure so the next miss re-triggers evaluation.
                self.consecutive_failures
                    .store(self.config.fail_threshold.saturating_sub(1), Ordering::SeqCst);
            }
        }

        self.set_state(STATE_MONITORING);
    }

    async fn monitor_loop(self: Arc<Self>) {
        debug!(interval = ?self.config.interval, "failover monitor started");
        loop {
            tokio::time::sleep(self.config.interval).await;

            let server = self.current_server();
            match self.probe.probe(&server, self.config.probe_timeout).await {
                Some(ms) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    let index = self.current.load(Ordering::SeqCst);
                    self.servers.write()[index].latency_ms = Some(ms);
                }
                None => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(server = %server.name, failures, "active server probe failed");
                    if failures >= self.config.fail_threshold {
                        self.evaluate_candidates().await;
                    }
                }
            }
        }
    }
}

/// Monitors a group of servers and fails over between them
pub struct FailoverController {
    inner: Arc<Inner>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl FailoverController {
    /// Build a controller over a non-empty server group
    pub fn new(
        servers: Vec<FailoverServer>,
        config: FailoverConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::config("failover requires at least one server"));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                servers: parking_lot::RwLock::new(servers),
                current: AtomicUsize::new(0),
                consecutive_failures: AtomicU32::new(0),
                state: AtomicU8::new(STATE_IDLE),
                config: config.normalized(),
                probe,
                on_switch: parking_lot::RwLock::new(None),
            }),
            task: parking_lot::Mutex::new(None),
        })
    }

    /// Install the hook fired after every switch
    pub fn set_switch_hook(&self, hook: SwitchHook) {
        *self.inner.on_switch.write() = Some(hook);
    }

    /// Start background monitoring; a no-op if already started
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        self.inner.set_state(STATE_MONITORING);
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(inner.monitor_loop()));
        info!("failover monitoring started");
    }

    /// Stop monitoring; the current server selection is kept
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("failover monitoring stopped");
        }
        self.inner.set_state(STATE_IDLE);
    }

    /// Manually switch to the server at `index`, valid in any state
    pub fn switch_server(&self, index: usize) -> Result<()> {
        if index >= self.inner.servers.read().len() {
            return Err(Error::not_found(format!("failover server index {index}")));
        }
        self.inner.apply_switch(index, None);
        Ok(())
    }

    pub fn current_server(&self) -> FailoverServer {
        self.inner.current_server()
    }

    pub fn current_index(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    pub fn servers(&self) -> Vec<FailoverServer> {
        self.inner.servers.read().clone()
    }

    pub fn state(&self) -> FailoverState {
        FailoverState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }
}

impl Drop for FailoverController {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Probe returning scripted latencies per server name
    struct FakeProbe {
        latencies: HashMap<String, Option<u32>>,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn probe(&self, server: &FailoverServer, _wait: Duration) -> Option<u32> {
            self.latencies.get(&server.name).copied().flatten()
        }
    }

    fn server(name: &str) -> FailoverServer {
        FailoverServer {
            name: name.into(),
            address: format!("{name}.example.net"),
            port: 443,
            instance_id: None,
            outbound_tag: String::new(),
            latency_ms: None,
        }
    }

    fn fast_config(threshold: u32) -> FailoverConfig {
        FailoverConfig {
            interval: Duration::from_millis(10),
            fail_threshold: threshold,
            latency_limit_ms: 0,
            probe_timeout: Duration::from_millis(100),
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn fails_over_to_lowest_latency_candidate() {
        let probe = FakeProbe {
            latencies: [
                ("a".to_string(), None),
                ("b".to_string(), Some(50)),
                ("c".to_string(), Some(30)),
            ]
            .into(),
        };
        let controller = FailoverController::new(
            vec![server("a"), server("b"), server("c")],
            fast_config(2),
            Arc::new(probe),
        )
        .unwrap();

        let switches = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&switches);
        controller.set_switch_hook(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        controller.start();
        assert_eq!(controller.state(), FailoverState::Monitoring);

        assert!(wait_for(|| controller.current_index() == 2).await);
        assert_eq!(controller.current_server().name, "c");
        assert_eq!(switches.load(Ordering::SeqCst), 1);

        // The new server is healthy, so no further switches happen.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(switches.load(Ordering::SeqCst), 1);

        controller.stop();
        assert_eq!(controller.state(), FailoverState::Idle);
    }

    #[tokio::test]
    async fn below_threshold_failures_do_not_switch() {
        // Active server is healthy; it never accumulates failures.
        let probe = FakeProbe {
            latencies: [
                ("a".to_string(), Some(20)),
                ("b".to_string(), Some(5)),
            ]
            .into(),
        };
        let controller = FailoverController::new(
            vec![server("a"), server("b")],
            fast_config(2),
            Arc::new(probe),
        )
        .unwrap();

        controller.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.current_index(), 0);
        controller.stop();
    }

    /// Probe whose first check of server "a" fails; every later check passes
    struct FlakyProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        async fn probe(&self, server: &FailoverServer, _wait: Duration) -> Option<u32> {
            match server.name.as_str() {
                "a" => {
                    if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        None
                    } else {
                        Some(20)
                    }
                }
                _ => Some(5),
            }
        }
    }

    #[tokio::test]
    async fn single_failure_does_not_switch() {
        // One failed probe against a threshold of two, with healthy
        // candidates standing by; the active server must be kept.
        let controller = FailoverController::new(
            vec![server("a"), server("b"), server("c")],
            fast_config(2),
            Arc::new(FlakyProbe {
                calls: AtomicUsize::new(0),
            }),
        )
        .unwrap();

        let switches = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&switches);
        controller.set_switch_hook(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        controller.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(controller.current_index(), 0);
        assert_eq!(switches.load(Ordering::SeqCst), 0);
        controller.stop();
    }

    #[tokio::test]
    async fn manual_switch_works_while_idle() {
        let probe = FakeProbe {
            latencies: HashMap::new(),
        };
        let controller = FailoverController::new(
            vec![server("a"), server("b")],
            fast_config(2),
            Arc::new(probe),
        )
        .unwrap();

        controller.switch_server(1).unwrap();
        assert_eq!(controller.current_server().name, "b");
        assert!(matches!(
            controller.switch_server(9),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn empty_group_is_rejected() {
        let probe = FakeProbe {
            latencies: HashMap::new(),
        };
        assert!(FailoverController::new(Vec::new(), fast_config(2), Arc::new(probe)).is_err());
    }
}
