//! Splitter: cut outbound payloads into checksummed chunks, track in-flight
//! split sessions, verify and reassemble chunk sets.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::SplittingConfig;
use crate::integrity::{self, Checksum};
use crate::session::SessionId;

/// Split sessions older than this are evicted regardless of completion.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// One fragment of a split payload. `index < total` always.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub session_id: SessionId,
    pub index: usize,
    pub total: usize,
    pub payload: Vec<u8>,
    pub checksum: Checksum,
}

impl Chunk {
    pub fn new(session_id: SessionId, index: usize, total: usize, payload: Vec<u8>) -> Self {
        let checksum = integrity::checksum(&payload);
        Self {
            session_id,
            index,
            total,
            payload,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        integrity::verify(&self.payload, &self.checksum)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("checksum mismatch for chunk {index} of session {session_id}")]
    ChecksumMismatch { session_id: SessionId, index: usize },
    #[error("split session {0} not found")]
    SessionNotFound(SessionId),
    #[error("chunk index {index} out of range for session {session_id} ({total} parts)")]
    InvalidIndex {
        session_id: SessionId,
        index: usize,
        total: usize,
    },
    #[error("missing parts for session {session_id}: {received}/{total}")]
    IncompleteSession {
        session_id: SessionId,
        received: usize,
        total: usize,
    },
    #[error("aggregate integrity check failed for session {0}")]
    IntegrityFailure(SessionId),
}

/// Notification raised by the splitter; the host drains these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitEvent {
    /// Every part of the session has been received. Reassembly is not automatic.
    Complete(SessionId),
}

/// In-flight reassembly record. `received.len() <= total_parts`.
struct SplitSession {
    total_parts: usize,
    received: HashSet<usize>,
    /// Payload slot per index; filled by `receive`.
    parts: Vec<Option<Vec<u8>>>,
    /// Digest over all payloads at split time.
    expected: Checksum,
    created_at: Instant,
}

impl SplitSession {
    fn is_complete(&self) -> bool {
        self.received.len() == self.total_parts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitStatus {
    pub total_parts: usize,
    pub received_parts: usize,
    pub complete: bool,
    pub age_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterStats {
    pub active_sessions: usize,
    pub buffered_chunks: usize,
    pub enabled: bool,
    pub chunk_size: usize,
    pub parts: usize,
    pub max_retries: u32,
}

pub struct Splitter {
    config: SplittingConfig,
    sessions: HashMap<SessionId, SplitSession>,
    events: Vec<SplitEvent>,
}

impl Splitter {
    pub fn new(config: &SplittingConfig) -> Self {
        Self {
            config: config.clone(),
            sessions: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// Split `payload` into `chunk_size` pieces. A payload that fits in one
    /// chunk (or splitting disabled) yields a single unregistered chunk;
    /// otherwise a split session is registered under `session_id`, replacing
    /// any previous one with that id.
    pub fn split(&mut self, payload: &[u8], session_id: SessionId) -> Vec<Chunk> {
        let size = self.config.chunk_size.max(1);
        let total = payload.len().div_ceil(size);
        if !self.config.enabled || total <= 1 {
            return vec![Chunk::new(session_id, 0, 1, payload.to_vec())];
        }
        let chunks: Vec<Chunk> = payload
            .chunks(size)
            .enumerate()
            .map(|(i, part)| Chunk::new(session_id, i, total, part.to_vec()))
            .collect();
        self.sessions.insert(
            session_id,
            SplitSession {
                total_parts: total,
                received: HashSet::with_capacity(total),
                parts: vec![None; total],
                expected: integrity::aggregate_checksum(
                    chunks.iter().map(|c| c.payload.as_slice()),
                ),
                created_at: Instant::now(),
            },
        );
        chunks
    }

    /// Store a verified chunk. Returns how many distinct parts have arrived.
    /// Raises `SplitEvent::Complete` the first time the set becomes complete.
    pub fn receive(&mut self, chunk: Chunk) -> Result<usize, SplitError> {
        if !chunk.verify() {
            return Err(SplitError::ChecksumMismatch {
                session_id: chunk.session_id,
                index: chunk.index,
            });
        }
        let session = self
            .sessions
            .get_mut(&chunk.session_id)
            .ok_or(SplitError::SessionNotFound(chunk.session_id))?;
        if chunk.index >= session.total_parts {
            return Err(SplitError::InvalidIndex {
                session_id: chunk.session_id,
                index: chunk.index,
                total: session.total_parts,
            });
        }
        let newly_received = session.received.insert(chunk.index);
        session.parts[chunk.index] = Some(chunk.payload);
        let count = session.received.len();
        if newly_received && session.is_complete() {
            self.events.push(SplitEvent::Complete(chunk.session_id));
        }
        Ok(count)
    }

    /// Concatenate a complete set in index order and check the aggregate
    /// digest. The session is consumed on success.
    pub fn reassemble(&mut self, session_id: &SessionId) -> Result<Vec<u8>, SplitError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or(SplitError::SessionNotFound(*session_id))?;
        if !session.is_complete() {
            return Err(SplitError::IncompleteSession {
                session_id: *session_id,
                received: session.received.len(),
                total: session.total_parts,
            });
        }
        let assembled: Vec<u8> = session.parts.iter().flatten().flatten().copied().collect();
        if integrity::checksum(&assembled) != session.expected {
            return Err(SplitError::IntegrityFailure(*session_id));
        }
        self.sessions.remove(session_id);
        Ok(assembled)
    }

    /// Drop a split session whatever its state. Returns whether it existed.
    pub fn discard(&mut self, session_id: &SessionId) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Evict sessions older than `max_age`. Returns how many were removed.
    pub fn evict_stale(&mut self, max_age: Duration) -> usize {
        self.evict_stale_at(Instant::now(), max_age)
    }

    pub fn evict_stale_at(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now.saturating_duration_since(s.created_at) <= max_age);
        before - self.sessions.len()
    }

    pub fn status(&self, session_id: &SessionId) -> Option<SplitStatus> {
        self.sessions.get(session_id).map(|s| SplitStatus {
            total_parts: s.total_parts,
            received_parts: s.received.len(),
            complete: s.is_complete(),
            age_ms: s.created_at.elapsed().as_millis() as u64,
        })
    }

    pub fn drain_events(&mut self) -> Vec<SplitEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> SplitterStats {
        SplitterStats {
            active_sessions: self.sessions.len(),
            buffered_chunks: self.sessions.values().map(|s| s.received.len()).sum(),
            enabled: self.config.enabled,
            chunk_size: self.config.chunk_size,
            parts: self.config.parts,
            max_retries: self.config.max_retries,
        }
    }
}
