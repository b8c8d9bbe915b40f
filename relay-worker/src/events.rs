//! Typed engine notifications. Delivery is best effort: nothing in the engine
//! depends on a notification being observed.

use std::net::SocketAddr;
use std::time::Duration;

use relay_core::{ByteCounters, PoolEvent, SessionId, SessionState};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ProxyChanged {
        index: usize,
        host: String,
        port: u16,
    },
    ProxyUnhealthy {
        index: usize,
        key: String,
        failures: u32,
    },
    ProxyRecovered {
        index: usize,
        key: String,
    },
    ConnectionCreated {
        session_id: SessionId,
        slot: usize,
        proxy: String,
        peer: Option<SocketAddr>,
    },
    ConnectionClosed {
        session_id: SessionId,
        duration: Duration,
        bytes: ByteCounters,
        state: SessionState,
    },
    SplitComplete {
        split_id: SessionId,
    },
}

impl From<PoolEvent> for EngineEvent {
    fn from(ev: PoolEvent) -> Self {
        match ev {
            PoolEvent::MarkedUnhealthy {
                index,
                key,
                failures,
            } => EngineEvent::ProxyUnhealthy {
                index,
                key,
                failures,
            },
            PoolEvent::Recovered { index, key } => EngineEvent::ProxyRecovered { index, key },
        }
    }
}

/// Cloneable sending half; a dropped receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<EngineEvent>>);

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_survives_closed_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(EngineEvent::SplitComplete {
            split_id: SessionId::generate(),
        });
        EventSink::disabled().emit(EngineEvent::ProxyRecovered {
            index: 0,
            key: "a:1".into(),
        });
    }

    #[test]
    fn pool_events_convert() {
        let ev: EngineEvent = PoolEvent::MarkedUnhealthy {
            index: 2,
            key: "10.0.0.3:8080".into(),
            failures: 3,
        }
        .into();
        assert_eq!(
            ev,
            EngineEvent::ProxyUnhealthy {
                index: 2,
                key: "10.0.0.3:8080".into(),
                failures: 3
            }
        );
    }
}
