//! WorkerEngine: one listening socket wired to a ProxyPool, Splitter and
//! Relay, plus the timers and the supervisor link. Everything it starts is
//! torn down by `stop`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use relay_core::protocol::CLIENT_FAILED;
use relay_core::{Config, ProxyPool, Splitter, SupervisorMessage, WorkerStats};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventSink};
use crate::health::{spawn_health_timer, spawn_rotation_timer, HealthMonitor};
use crate::relay::{Relay, RelayError};
use crate::supervisor::{resident_memory, SupervisorLink};
use crate::timer::spawn_periodic;

pub struct WorkerEngine {
    config: Arc<Config>,
    worker_id: u16,
    pool: Arc<Mutex<ProxyPool>>,
    splitter: Arc<Mutex<Splitter>>,
    relay: Arc<Relay>,
    health: Arc<HealthMonitor>,
    events: EventSink,
    events_rx: Option<UnboundedReceiver<EngineEvent>>,
    supervisor: SupervisorLink,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    port: u16,
}

impl WorkerEngine {
    pub fn new(config: Config, worker_id: u16, supervisor: SupervisorLink) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let pool = ProxyPool::new(&config.proxies, &config.proxy).context("building proxy pool")?;
        let pool = Arc::new(Mutex::new(pool));
        let splitter = Arc::new(Mutex::new(Splitter::new(&config.splitting)));
        let config = Arc::new(config);
        let (events, events_rx) = EventSink::channel();
        let relay = Arc::new(Relay::new(
            config.clone(),
            pool.clone(),
            splitter.clone(),
            events.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            pool.clone(),
            config.proxy.probe_timeout(),
            events.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            port: config.worker_port(worker_id),
            config,
            worker_id,
            pool,
            splitter,
            relay,
            health,
            events,
            events_rx: Some(events_rx),
            supervisor,
            shutdown,
            tasks: Vec::new(),
        })
    }

    /// Bind `server.host:(base_port + worker_id)`.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.server.host, self.port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))
    }

    /// Start accepting on `listener` and start every timer. Returns the bound address.
    pub fn start(&mut self, listener: TcpListener) -> Result<SocketAddr> {
        let local = listener.local_addr().context("listener address")?;
        self.port = local.port();
        info!(worker = self.worker_id, addr = %local, "listening");

        if let Some(rx) = self.events_rx.take() {
            self.tasks.push(tokio::spawn(log_events(
                rx,
                self.supervisor.clone(),
                self.shutdown.subscribe(),
            )));
        }

        let admission = Arc::new(Semaphore::new(self.config.server.max_connections));
        self.tasks.push(tokio::spawn(accept_loop(
            listener,
            self.relay.clone(),
            admission,
            self.config.server.max_connections,
            self.supervisor.clone(),
            self.shutdown.subscribe(),
        )));

        let policy = &self.config.proxy;
        self.tasks.push(spawn_rotation_timer(
            self.pool.clone(),
            policy.rotation_interval(),
            self.events.clone(),
            self.shutdown.subscribe(),
        ));
        self.tasks.push(spawn_health_timer(
            self.health.clone(),
            policy.health_check_interval(),
            self.shutdown.subscribe(),
        ));

        let splitter = self.splitter.clone();
        let ttl = self.config.splitting.session_ttl();
        self.tasks.push(spawn_periodic(
            "eviction",
            self.config.splitting.eviction_interval(),
            self.shutdown.subscribe(),
            move || {
                let splitter = splitter.clone();
                async move {
                    let evicted = splitter.lock().await.evict_stale(ttl);
                    if evicted > 0 {
                        info!(evicted, "evicted stale split sessions");
                    }
                }
            },
        ));

        let source = self.stats_source();
        let supervisor = self.supervisor.clone();
        self.tasks.push(spawn_periodic(
            "heartbeat",
            self.config.supervisor.heartbeat_interval(),
            self.shutdown.subscribe(),
            move || {
                let source = source.clone();
                let supervisor = supervisor.clone();
                async move {
                    let stats = source.collect().await;
                    supervisor.send(SupervisorMessage::Heartbeat {
                        worker_id: supervisor.worker_id(),
                        memory: resident_memory(),
                        stats,
                    });
                }
            },
        ));

        self.supervisor.send(SupervisorMessage::Started {
            worker_id: self.worker_id,
            port: self.port,
        });
        Ok(local)
    }

    /// Stop accepting, cancel timers, close every session and report final stats.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        for s in self.relay.sessions().await {
            debug!(
                session = %s.id,
                slot = s.slot,
                proxy = %s.proxy,
                peer = ?s.peer,
                state = ?s.state,
                "closing live session"
            );
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        let closed = self.relay.close_all().await;
        let stats = self.stats().await;
        info!(
            worker = self.worker_id,
            closed,
            total = stats.relay.total_connections,
            failed = stats.relay.failed_connections,
            "engine stopped"
        );
        self.supervisor.send(SupervisorMessage::Stats {
            worker_id: self.worker_id,
            stats,
        });
    }

    pub async fn stats(&self) -> WorkerStats {
        self.stats_source().collect().await
    }

    fn stats_source(&self) -> StatsSource {
        StatsSource {
            worker_id: self.worker_id,
            port: self.port,
            relay: self.relay.clone(),
            splitter: self.splitter.clone(),
            pool: self.pool.clone(),
        }
    }
}

#[derive(Clone)]
struct StatsSource {
    worker_id: u16,
    port: u16,
    relay: Arc<Relay>,
    splitter: Arc<Mutex<Splitter>>,
    pool: Arc<Mutex<ProxyPool>>,
}

impl StatsSource {
    async fn collect(&self) -> WorkerStats {
        let snapshot = self.relay.snapshot().await;
        let splitter = self.splitter.lock().await.stats();
        let proxies = self.pool.lock().await.stats();
        WorkerStats {
            worker_id: self.worker_id,
            port: self.port,
            relay: snapshot.relay,
            slots: snapshot.slots,
            distribution: snapshot.distribution,
            splitter,
            proxies,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    relay: Arc<Relay>,
    admission: Arc<Semaphore>,
    limit: usize,
    supervisor: SupervisorLink,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        match admission.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(handle_client(
                    relay.clone(),
                    supervisor.clone(),
                    stream,
                    peer,
                    permit,
                ));
            }
            Err(_) => {
                let err = RelayError::CapacityExceeded(limit);
                warn!(peer = %peer, error = %err, "rejecting client");
                tokio::spawn(reject(stream));
            }
        }
    }
    debug!("accept loop stopped");
}

async fn handle_client(
    relay: Arc<Relay>,
    supervisor: SupervisorLink,
    mut client: TcpStream,
    peer: SocketAddr,
    _permit: OwnedSemaphorePermit,
) {
    match relay.create_connection(Some(peer)).await {
        Ok(tunnel) => {
            let id = tunnel.session_id;
            if let Err(e) = relay.relay(tunnel, client).await {
                debug!(session = %id, error = %e, "session ended with error");
            }
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "tunnel setup failed");
            supervisor.error(&e);
            reject_with(&mut client).await;
        }
    }
}

async fn reject(mut client: TcpStream) {
    reject_with(&mut client).await;
}

async fn reject_with(client: &mut TcpStream) {
    let _ = client.write_all(CLIENT_FAILED).await;
    let _ = client.shutdown().await;
}

async fn log_events(
    mut rx: UnboundedReceiver<EngineEvent>,
    supervisor: SupervisorLink,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            EngineEvent::ProxyChanged { index, host, port } => {
                info!(index, proxy = %format!("{host}:{port}"), "proxy changed");
                supervisor.send(SupervisorMessage::ProxyChanged {
                    worker_id: supervisor.worker_id(),
                    index,
                    host,
                    port,
                });
            }
            EngineEvent::ConnectionCreated {
                session_id,
                slot,
                proxy,
                peer,
            } => debug!(session = %session_id, slot, proxy = %proxy, peer = ?peer, "connection created"),
            EngineEvent::ConnectionClosed {
                session_id,
                duration,
                bytes,
                state,
            } => debug!(
                session = %session_id,
                duration_ms = duration.as_millis() as u64,
                bytes_in = bytes.bytes_in,
                bytes_out = bytes.bytes_out,
                state = ?state,
                "connection closed"
            ),
            EngineEvent::SplitComplete { split_id } => {
                debug!(split = %split_id, "split session complete")
            }
            EngineEvent::ProxyUnhealthy {
                index,
                key,
                failures,
            } => supervisor.error(format!(
                "proxy {index} ({key}) unhealthy after {failures} failed probes"
            )),
            EngineEvent::ProxyRecovered { index, key } => {
                debug!(index, proxy = %key, "proxy back in rotation")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dead_addr, echo_upstream};
    use relay_core::config::ProxyConfig;
    use relay_core::protocol::CLIENT_ESTABLISHED;
    use tokio::io::AsyncReadExt;

    fn config_for(addr: SocketAddr) -> Config {
        let mut config = Config {
            proxies: vec![ProxyConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                weight: 10,
            }],
            ..Config::default()
        };
        config.server.host = "127.0.0.1".to_string();
        config
    }

    async fn started(config: Config) -> (WorkerEngine, SocketAddr, UnboundedReceiver<SupervisorMessage>) {
        let (link, rx) = SupervisorLink::channel(7);
        let mut engine = WorkerEngine::new(config, 7, link).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = engine.start(listener).unwrap();
        (engine, addr, rx)
    }

    #[tokio::test]
    async fn client_gets_established_and_echo() {
        let (upstream, _task) = echo_upstream().await;
        let (mut engine, addr, mut rx) = started(config_for(upstream)).await;
        match rx.recv().await.unwrap() {
            SupervisorMessage::Started { worker_id, port } => {
                assert_eq!(worker_id, 7);
                assert_eq!(port, addr.port());
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut reply = vec![0u8; CLIENT_ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, CLIENT_ESTABLISHED);
        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        engine.stop().await;
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let mut final_stats = None;
        while let Ok(msg) = rx.try_recv() {
            if let SupervisorMessage::Stats { stats, .. } = msg {
                final_stats = Some(stats);
            }
        }
        let stats = final_stats.unwrap();
        assert_eq!(stats.relay.total_connections, 1);
        assert_eq!(stats.relay.active_connections, 0);
        assert_eq!(stats.port, addr.port());
    }

    #[tokio::test]
    async fn failed_tunnel_gets_500_then_close() {
        let dead = dead_addr().await;
        let (mut engine, addr, mut rx) = started(config_for(dead)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, CLIENT_FAILED);

        let mut saw_error = false;
        while !saw_error {
            if let SupervisorMessage::Error { error, .. } = rx.recv().await.unwrap() {
                assert!(error.contains("failed"), "{error}");
                saw_error = true;
            }
        }
        assert_eq!(engine.stats().await.relay.failed_connections, 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn over_capacity_client_is_rejected() {
        let (upstream, _task) = echo_upstream().await;
        let mut config = config_for(upstream);
        config.server.max_connections = 1;
        let (mut engine, addr, _rx) = started(config).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut reply = vec![0u8; CLIENT_ESTABLISHED.len()];
        first.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, CLIENT_ESTABLISHED);

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut rejected = Vec::new();
        second.read_to_end(&mut rejected).await.unwrap();
        assert_eq!(rejected, CLIENT_FAILED);

        engine.stop().await;
    }

    #[test]
    fn rejects_invalid_config() {
        let err = WorkerEngine::new(Config::default(), 0, SupervisorLink::disabled(0))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("no proxies"));
    }
}
