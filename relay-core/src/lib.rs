//! Split-relay tunnel engine core.
//! Host-driven: no I/O; the host owns sockets and timers and feeds outcomes in.

pub mod chunk;
pub mod config;
pub mod integrity;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod wire;

pub use chunk::{Chunk, SplitError, SplitEvent, Splitter};
pub use config::{Config, ConfigError, LoadBalancing};
pub use pool::{PoolError, PoolEvent, ProxyEndpoint, ProxyPool};
pub use protocol::{RelayStats, SupervisorMessage, WorkerStats};
pub use scheduler::SlotTable;
pub use session::{ByteCounters, SessionId, SessionState};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
