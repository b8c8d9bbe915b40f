//! Proxy health probing and the two pool timers (rotation and health cycle).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use relay_core::{PoolEvent, ProxyPool};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventSink};
use crate::timer::spawn_periodic;

/// Bare TCP reachability check: connect within `timeout`, then close.
pub async fn probe_health(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub probed: usize,
    pub reachable: usize,
    pub transitions: Vec<PoolEvent>,
}

/// Clears the in-progress flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct HealthMonitor {
    pool: Arc<Mutex<ProxyPool>>,
    probe_timeout: Duration,
    events: EventSink,
    running: AtomicBool,
}

impl HealthMonitor {
    pub fn new(pool: Arc<Mutex<ProxyPool>>, probe_timeout: Duration, events: EventSink) -> Self {
        Self {
            pool,
            probe_timeout,
            events,
            running: AtomicBool::new(false),
        }
    }

    /// Probe every endpoint once and apply the outcomes. Returns `None`
    /// without probing if another cycle is still in progress. The pool lock
    /// is only held while recording, never across a probe.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let Some(_guard) = CycleGuard::acquire(&self.running) else {
            debug!("health cycle still running; skipped");
            return None;
        };
        let targets: Vec<(usize, String)> = {
            let pool = self.pool.lock().await;
            pool.endpoints()
                .iter()
                .enumerate()
                .map(|(i, e)| (i, e.key()))
                .collect()
        };
        let mut report = CycleReport::default();
        for (index, key) in targets {
            let reachable = probe_health(&key, self.probe_timeout).await;
            report.probed += 1;
            if reachable {
                report.reachable += 1;
            }
            let outcome = self
                .pool
                .lock()
                .await
                .record_probe(index, reachable, SystemTime::now());
            match outcome {
                Ok(Some(event)) => {
                    match &event {
                        PoolEvent::MarkedUnhealthy { key, failures, .. } => {
                            warn!(proxy = %key, failures, "proxy marked unhealthy")
                        }
                        PoolEvent::Recovered { key, .. } => info!(proxy = %key, "proxy recovered"),
                    }
                    self.events.emit(event.clone().into());
                    report.transitions.push(event);
                }
                Ok(None) if !reachable => debug!(proxy = %key, "health probe failed"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "health probe result dropped"),
            }
        }
        Some(report)
    }
}

pub fn spawn_health_timer(
    monitor: Arc<HealthMonitor>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("health", interval, shutdown, move || {
        let monitor = monitor.clone();
        async move {
            if let Some(report) = monitor.run_cycle().await {
                debug!(
                    probed = report.probed,
                    reachable = report.reachable,
                    transitions = report.transitions.len(),
                    "health cycle finished"
                );
            }
        }
    })
}

/// Periodically force a reselection regardless of balancing mode.
pub fn spawn_rotation_timer(
    pool: Arc<Mutex<ProxyPool>>,
    interval: Duration,
    events: EventSink,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("rotation", interval, shutdown, move || {
        let pool = pool.clone();
        let events = events.clone();
        async move {
            let (index, host, port) = {
                let mut pool = pool.lock().await;
                let endpoint = pool.select();
                let (host, port) = (endpoint.host.clone(), endpoint.port);
                (pool.current_index(), host, port)
            };
            debug!(index, proxy = %format!("{host}:{port}"), "proxy rotated");
            events.emit(EngineEvent::ProxyChanged { index, host, port });
        }
    })
}
