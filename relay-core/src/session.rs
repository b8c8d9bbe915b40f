//! Session identity, lifecycle states and byte counters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque 128-bit random session identifier, rendered as 32 lowercase hex chars.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).simple())
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::try_parse(s).map(|u| Self(u.into_bytes()))
    }
}

/// Lifecycle: `Connecting -> Connected -> Relaying -> Closed`, with `Error`
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Upstream dial in progress.
    Connecting,
    /// CONNECT preamble sent.
    Connected,
    /// Bidirectional piping active.
    Relaying,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, Connected) | (Connected, Relaying) => true,
            (from, Closed) | (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Byte counters for one session. `bytes_in` is client to upstream,
/// `bytes_out` is upstream to client.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ByteCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ByteCounters {
    pub fn total(&self) -> u64 {
        self.bytes_in + self.bytes_out
    }
}
