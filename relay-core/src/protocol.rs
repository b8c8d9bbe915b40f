//! Wire strings for the upstream CONNECT preamble and client replies, the
//! inbound fragmentation predicate, and supervisor message types.

use serde::{Deserialize, Serialize};

use crate::chunk::SplitterStats;
use crate::config::TunnelConfig;
use crate::pool::ProxyPoolStats;
use crate::scheduler::SlotStats;

/// Sent to the client once the upstream tunnel is up.
pub const CLIENT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Sent to the client when the upstream tunnel could not be built.
pub const CLIENT_FAILED: &[u8] = b"HTTP/1.1 500 Connection Failed\r\n\r\n";

/// Byte sequences that mark an inbound payload as fragmented.
const FRAGMENT_MARKERS: [&[u8]; 3] = [
    b"multipart/byteranges",
    b"boundary=",
    b"Content-Range: bytes",
];

/// Build the fixed CONNECT request written on every upstream socket.
pub fn connect_preamble(tunnel: &TunnelConfig) -> Vec<u8> {
    format!(
        "CONNECT {target} HTTP/1.1\r\n\
         Host: {target}\r\n\
         User-Agent: {ua}\r\n\
         {name}: {value}\r\n\
         \r\n",
        target = tunnel.target,
        ua = tunnel.user_agent,
        name = tunnel.identity_header,
        value = tunnel.identity_value,
    )
    .into_bytes()
}

/// Heuristic: does this inbound payload carry multipart/byte-range framing?
pub fn is_fragmented(payload: &[u8]) -> bool {
    FRAGMENT_MARKERS
        .iter()
        .any(|marker| payload.windows(marker.len()).any(|w| w == *marker))
}

/// Relay-level counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub failed_connections: u64,
    pub bytes_transferred: u64,
    pub uptime_secs: u64,
}

/// Snapshot of one worker, carried by heartbeat and stats messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: u16,
    pub port: u16,
    pub relay: RelayStats,
    pub slots: Vec<SlotStats>,
    pub distribution: Vec<u64>,
    pub splitter: SplitterStats,
    pub proxies: ProxyPoolStats,
}

/// One-way messages from a worker to its supervisor. Fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SupervisorMessage {
    Started {
        worker_id: u16,
        port: u16,
    },
    /// Periodic liveness with resident memory in bytes.
    Heartbeat {
        worker_id: u16,
        memory: u64,
        stats: WorkerStats,
    },
    Stats {
        worker_id: u16,
        stats: WorkerStats,
    },
    ProxyChanged {
        worker_id: u16,
        index: usize,
        host: String,
        port: u16,
    },
    Error {
        worker_id: u16,
        error: String,
    },
}
