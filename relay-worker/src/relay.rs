//! Relay: owns per-session socket pairs, assigns sessions to worker slots,
//! pipes bytes both ways through the splitter, and guarantees that cleanup
//! runs exactly once per session.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use relay_core::integrity;
use relay_core::protocol::{self, CLIENT_ESTABLISHED, CLIENT_FAILED};
use relay_core::scheduler::SlotStats;
use relay_core::{
    ByteCounters, Config, ProxyPool, RelayStats, SessionId, SessionState, SlotTable, SplitError,
    SplitEvent, Splitter,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::events::{EngineEvent, EventSink};

const RELAY_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Upstream,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Client => f.write_str("client"),
            Leg::Upstream => f.write_str("upstream"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("proxy connect to {proxy} failed: {source}")]
    ProxyConnect {
        proxy: String,
        #[source]
        source: std::io::Error,
    },
    #[error("proxy connect to {proxy} timed out after {timeout:?}")]
    ProxyTimeout { proxy: String, timeout: Duration },
    #[error("{leg} socket error: {source}")]
    Socket {
        leg: Leg,
        #[source]
        source: std::io::Error,
    },
    #[error("connection limit of {0} reached")]
    CapacityExceeded(usize),
    #[error(transparent)]
    Split(#[from] SplitError),
}

impl RelayError {
    fn socket(leg: Leg, source: std::io::Error) -> Self {
        RelayError::Socket { leg, source }
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub slot: usize,
    pub proxy: String,
    pub peer: Option<SocketAddr>,
    pub bytes: ByteCounters,
    pub state: SessionState,
    pub created_at: Instant,
}

/// Upstream leg that has been dialed and has received the CONNECT preamble.
pub struct Tunnel {
    pub session_id: SessionId,
    pub slot: usize,
    upstream: TcpStream,
    shutdown: watch::Receiver<bool>,
}

struct SessionEntry {
    info: SessionInfo,
    /// Dropping this wakes the piping task, which releases both sockets.
    _shutdown: watch::Sender<bool>,
    /// Outbound split sessions still awaiting full delivery.
    splits: HashSet<SessionId>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    active: u64,
    failed: u64,
    bytes: u64,
}

struct RelayState {
    sessions: HashMap<SessionId, SessionEntry>,
    slots: SlotTable,
    counters: Counters,
}

#[derive(Debug, Clone)]
pub struct RelaySnapshot {
    pub relay: RelayStats,
    pub slots: Vec<SlotStats>,
    pub distribution: Vec<u64>,
}

pub struct Relay {
    config: Arc<Config>,
    preamble: Vec<u8>,
    pool: Arc<Mutex<ProxyPool>>,
    splitter: Arc<Mutex<Splitter>>,
    state: Mutex<RelayState>,
    events: EventSink,
    started: Instant,
}

impl Relay {
    pub fn new(
        config: Arc<Config>,
        pool: Arc<Mutex<ProxyPool>>,
        splitter: Arc<Mutex<Splitter>>,
        events: EventSink,
    ) -> Self {
        let slots = SlotTable::new(config.splitting.parts, config.server.rebase_threshold);
        Self {
            preamble: protocol::connect_preamble(&config.tunnel),
            config,
            pool,
            splitter,
            state: Mutex::new(RelayState {
                sessions: HashMap::new(),
                slots,
                counters: Counters::default(),
            }),
            events,
            started: Instant::now(),
        }
    }

    /// Register a session, dial the selected proxy and send the CONNECT
    /// preamble. On any failure the session is cleaned up before the error
    /// is returned; the caller reports the failure to the client.
    pub async fn create_connection(&self, peer: Option<SocketAddr>) -> Result<Tunnel, RelayError> {
        let id = SessionId::generate();
        let proxy = {
            let mut pool = self.pool.lock().await;
            pool.select().key()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slot = {
            let mut st = self.state.lock().await;
            let slot = st.slots.assign(id);
            st.sessions.insert(
                id,
                SessionEntry {
                    info: SessionInfo {
                        id,
                        slot,
                        proxy: proxy.clone(),
                        peer,
                        bytes: ByteCounters::default(),
                        state: SessionState::Connecting,
                        created_at: Instant::now(),
                    },
                    _shutdown: shutdown_tx,
                    splits: HashSet::new(),
                },
            );
            st.counters.active += 1;
            slot
        };

        let timeout = self.config.server.dial_timeout();
        let dialed = tokio::time::timeout(timeout, TcpStream::connect(proxy.as_str())).await;
        let mut upstream = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(self
                    .fail(id, RelayError::ProxyConnect { proxy, source })
                    .await)
            }
            Err(_) => return Err(self.fail(id, RelayError::ProxyTimeout { proxy, timeout }).await),
        };
        if let Err(e) = upstream.write_all(&self.preamble).await {
            return Err(self.fail(id, RelayError::socket(Leg::Upstream, e)).await);
        }
        self.transition(id, SessionState::Connected).await;
        self.state.lock().await.counters.total += 1;
        self.events.emit(EngineEvent::ConnectionCreated {
            session_id: id,
            slot,
            proxy,
            peer,
        });
        Ok(Tunnel {
            session_id: id,
            slot,
            upstream,
            shutdown: shutdown_rx,
        })
    }

    async fn fail(&self, id: SessionId, err: RelayError) -> RelayError {
        self.state.lock().await.counters.failed += 1;
        self.cleanup(id, SessionState::Error).await;
        err
    }

    /// Confirm the tunnel to the client and pipe until either side closes,
    /// errors, idles out or the session is cleaned up elsewhere.
    pub async fn relay(&self, tunnel: Tunnel, mut client: TcpStream) -> Result<(), RelayError> {
        let Tunnel {
            session_id: id,
            slot,
            upstream,
            shutdown,
        } = tunnel;
        if !self.transition(id, SessionState::Relaying).await {
            // Cleaned up between setup and hand-off; the tunnel is gone.
            let _ = client.write_all(CLIENT_FAILED).await;
            let _ = client.shutdown().await;
            return Ok(());
        }
        if let Err(e) = client.write_all(CLIENT_ESTABLISHED).await {
            self.cleanup(id, SessionState::Error).await;
            return Err(RelayError::socket(Leg::Client, e));
        }
        let (mut client_rd, mut client_wr) = client.into_split();
        let (mut upstream_rd, mut upstream_wr) = upstream.into_split();
        let outcome = self
            .pipe(
                id,
                slot,
                &mut client_rd,
                &mut client_wr,
                &mut upstream_rd,
                &mut upstream_wr,
                shutdown,
            )
            .await;
        let final_state = if outcome.is_ok() {
            SessionState::Closed
        } else {
            SessionState::Error
        };
        self.cleanup(id, final_state).await;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn pipe<CR, CW, UR, UW>(
        &self,
        id: SessionId,
        slot: usize,
        client_rd: &mut CR,
        client_wr: &mut CW,
        upstream_rd: &mut UR,
        upstream_wr: &mut UW,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RelayError>
    where
        CR: AsyncRead + Unpin,
        CW: AsyncWrite + Unpin,
        UR: AsyncRead + Unpin,
        UW: AsyncWrite + Unpin,
    {
        let idle = match self.config.server.idle_timeout() {
            d if d.is_zero() => Duration::MAX,
            d => d,
        };
        let mut client_buf = vec![0u8; RELAY_BUF_SIZE];
        let mut upstream_buf = vec![0u8; RELAY_BUF_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = tokio::time::sleep(idle) => {
                    if let Some(info) = self.session(&id).await {
                        debug!(session = %id, bytes = info.bytes.total(), "idle timeout");
                    }
                    return Ok(());
                }
                read = client_rd.read(&mut client_buf) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => self.forward_outbound(id, slot, &client_buf[..n], upstream_wr).await?,
                    Err(e) => return Err(RelayError::socket(Leg::Client, e)),
                },
                read = upstream_rd.read(&mut upstream_buf) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => self.forward_inbound(id, &upstream_buf[..n], client_wr).await?,
                    Err(e) => return Err(RelayError::socket(Leg::Upstream, e)),
                },
            }
        }
    }

    /// Client -> upstream. With splitting enabled each chunk is charged to
    /// slot `(assigned + index) % slots` and written in index order.
    async fn forward_outbound<W>(
        &self,
        id: SessionId,
        slot: usize,
        data: &[u8],
        upstream: &mut W,
    ) -> Result<(), RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        self.count_bytes(id, data.len(), true).await;
        if !self.config.splitting.enabled {
            self.write_part(upstream, data).await?;
            self.state
                .lock()
                .await
                .slots
                .record_delivery(slot, data.len(), Instant::now());
            return Ok(());
        }

        let split_id = SessionId::generate();
        let chunks = self.splitter.lock().await.split(data, split_id);
        let tracked = chunks.len() > 1;
        if tracked {
            if let Some(entry) = self.state.lock().await.sessions.get_mut(&id) {
                entry.splits.insert(split_id);
            }
        }
        for chunk in chunks {
            let len = chunk.payload.len();
            self.delivery_jitter().await;
            self.write_part(upstream, &chunk.payload).await?;
            {
                let mut st = self.state.lock().await;
                let target = st.slots.chunk_slot(slot, chunk.index);
                st.slots.record_delivery(target, len, Instant::now());
            }
            if tracked {
                self.acknowledge(id, chunk).await;
            }
        }
        Ok(())
    }

    /// Record delivery of an outbound chunk; the split session is released
    /// once every part has gone out.
    async fn acknowledge(&self, id: SessionId, chunk: relay_core::Chunk) {
        let split_id = chunk.session_id;
        let total = chunk.total;
        let digest = chunk.checksum;
        let (done, events) = {
            let mut splitter = self.splitter.lock().await;
            match splitter.receive(chunk) {
                Ok(received) if received == total => {
                    if let Some(status) = splitter.status(&split_id) {
                        debug!(
                            session = %id,
                            split = %split_id,
                            parts = status.total_parts,
                            age_ms = status.age_ms,
                            "outbound split delivered"
                        );
                    }
                    splitter.discard(&split_id);
                    (true, splitter.drain_events())
                }
                Ok(_) => (false, Vec::new()),
                Err(e) => {
                    warn!(
                        session = %id,
                        checksum = %integrity::to_hex(&digest),
                        error = %e,
                        "outbound chunk rejected"
                    );
                    splitter.discard(&split_id);
                    (true, Vec::new())
                }
            }
        };
        self.emit_split_events(events);
        if done {
            if let Some(entry) = self.state.lock().await.sessions.get_mut(&id) {
                entry.splits.remove(&split_id);
            }
        }
    }

    /// Upstream -> client. Fragmented payloads make a checksummed round trip
    /// through the splitter before being forwarded. The chunks come from the
    /// same buffer, so the round trip only fails on a splitter bug; such a
    /// payload is logged and dropped while the session continues.
    async fn forward_inbound<W>(
        &self,
        id: SessionId,
        data: &[u8],
        client: &mut W,
    ) -> Result<(), RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        self.count_bytes(id, data.len(), false).await;
        if !protocol::is_fragmented(data) {
            return client
                .write_all(data)
                .await
                .map_err(|e| RelayError::socket(Leg::Client, e));
        }
        match self.reassemble_inbound(data).await {
            Ok(payload) => client
                .write_all(&payload)
                .await
                .map_err(|e| RelayError::socket(Leg::Client, e)),
            Err(e) => {
                warn!(session = %id, error = %e, "failed to reassemble inbound payload");
                Ok(())
            }
        }
    }

    async fn reassemble_inbound(&self, data: &[u8]) -> Result<Vec<u8>, RelayError> {
        let split_id = SessionId::generate();
        let (result, events) = {
            let mut splitter = self.splitter.lock().await;
            let chunks = splitter.split(data, split_id);
            if chunks.len() == 1 {
                return Ok(data.to_vec());
            }
            let mut result: Result<(), SplitError> = Ok(());
            for chunk in chunks {
                if let Err(e) = splitter.receive(chunk) {
                    result = Err(e);
                    break;
                }
            }
            let result = result.and_then(|_| splitter.reassemble(&split_id));
            if result.is_err() {
                splitter.discard(&split_id);
            }
            (result, splitter.drain_events())
        };
        self.emit_split_events(events);
        result.map_err(RelayError::from)
    }

    fn emit_split_events(&self, events: Vec<SplitEvent>) {
        for SplitEvent::Complete(split_id) in events {
            self.events.emit(EngineEvent::SplitComplete { split_id });
        }
    }

    async fn write_part<W>(&self, upstream: &mut W, payload: &[u8]) -> Result<(), RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let limit = self.config.splitting.timeout_per_part();
        match tokio::time::timeout(limit, upstream.write_all(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::socket(Leg::Upstream, e)),
            Err(_) => Err(RelayError::socket(
                Leg::Upstream,
                std::io::Error::new(std::io::ErrorKind::TimedOut, "chunk write timed out"),
            )),
        }
    }

    async fn delivery_jitter(&self) {
        let max = self.config.splitting.delivery_jitter_ms;
        if max == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(0..=max);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn count_bytes(&self, id: SessionId, n: usize, outbound: bool) {
        let mut st = self.state.lock().await;
        st.counters.bytes += n as u64;
        if let Some(entry) = st.sessions.get_mut(&id) {
            if outbound {
                entry.info.bytes.bytes_in += n as u64;
            } else {
                entry.info.bytes.bytes_out += n as u64;
            }
        }
    }

    /// Apply a forward transition. Returns false if the session is gone or
    /// the transition is not allowed.
    async fn transition(&self, id: SessionId, next: SessionState) -> bool {
        let mut st = self.state.lock().await;
        match st.sessions.get_mut(&id) {
            Some(entry) if entry.info.state.can_transition_to(next) => {
                entry.info.state = next;
                true
            }
            _ => false,
        }
    }

    /// Tear down a session: release both sockets, leave its slot, decrement
    /// counters, drop its split sessions and emit one closed notification.
    /// Returns false if the session was already cleaned up.
    pub async fn cleanup(&self, id: SessionId, final_state: SessionState) -> bool {
        let entry = {
            let mut st = self.state.lock().await;
            let Some(entry) = st.sessions.remove(&id) else {
                return false;
            };
            st.slots.release(entry.info.slot, &id);
            st.counters.active = st.counters.active.saturating_sub(1);
            entry
        };
        if !entry.splits.is_empty() {
            let mut splitter = self.splitter.lock().await;
            for split_id in &entry.splits {
                splitter.discard(split_id);
            }
        }
        let state = if entry.info.state.can_transition_to(final_state) {
            final_state
        } else {
            entry.info.state
        };
        self.events.emit(EngineEvent::ConnectionClosed {
            session_id: id,
            duration: entry.info.created_at.elapsed(),
            bytes: entry.info.bytes,
            state,
        });
        true
    }

    /// Close every live session.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.state.lock().await.sessions.keys().copied().collect();
        let mut closed = 0;
        for id in ids {
            if self.cleanup(id, SessionState::Closed).await {
                closed += 1;
            }
        }
        closed
    }

    pub async fn session(&self, id: &SessionId) -> Option<SessionInfo> {
        self.state
            .lock()
            .await
            .sessions
            .get(id)
            .map(|e| e.info.clone())
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    pub async fn snapshot(&self) -> RelaySnapshot {
        let st = self.state.lock().await;
        RelaySnapshot {
            relay: RelayStats {
                total_connections: st.counters.total,
                active_connections: st.counters.active,
                failed_connections: st.counters.failed,
                bytes_transferred: st.counters.bytes,
                uptime_secs: self.started.elapsed().as_secs(),
            },
            slots: st.slots.stats(Instant::now()),
            distribution: st.slots.load().to_vec(),
        }
    }
}
