//! One-way link to the supervising process: length-prefixed bincode frames
//! on stdout. Sends never block the engine; a broken link is logged and
//! otherwise ignored.

use std::fmt::Display;

use relay_core::wire::encode_frame;
use relay_core::SupervisorMessage;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SupervisorLink {
    worker_id: u16,
    tx: Option<mpsc::UnboundedSender<SupervisorMessage>>,
}

impl SupervisorLink {
    /// Link that drops every message (unsupervised run).
    pub fn disabled(worker_id: u16) -> Self {
        Self {
            worker_id,
            tx: None,
        }
    }

    pub fn channel(worker_id: u16) -> (Self, mpsc::UnboundedReceiver<SupervisorMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                worker_id,
                tx: Some(tx),
            },
            rx,
        )
    }

    /// Link whose frames are written to this process's stdout.
    pub fn stdout(worker_id: u16) -> (Self, JoinHandle<tokio::io::Stdout>) {
        let (link, rx) = Self::channel(worker_id);
        (link, spawn_writer(rx, tokio::io::stdout()))
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    pub fn send(&self, msg: SupervisorMessage) {
        if let Some(tx) = &self.tx {
            if tx.send(msg).is_err() {
                debug!("supervisor link closed; message dropped");
            }
        }
    }

    pub fn error(&self, err: impl Display) {
        self.send(SupervisorMessage::Error {
            worker_id: self.worker_id,
            error: err.to_string(),
        });
    }
}

/// Drain `rx` into `out` as frames until every sender is gone. Returns the writer.
pub fn spawn_writer<W>(mut rx: mpsc::UnboundedReceiver<SupervisorMessage>, mut out: W) -> JoinHandle<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match encode_frame(&msg) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "failed to encode supervisor message");
                    continue;
                }
            };
            if let Err(e) = out.write_all(&frame).await {
                warn!(error = %e, "supervisor link write failed");
                continue;
            }
            let _ = out.flush().await;
        }
        out
    })
}

/// Resident set size of this process in bytes; 0 where /proc is unavailable.
pub fn resident_memory() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| parse_vm_rss(&s))
        .unwrap_or(0)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::wire::decode_frame;

    #[tokio::test]
    async fn writer_emits_decodable_frames() {
        let (link, rx) = SupervisorLink::channel(3);
        let writer = spawn_writer(rx, Vec::new());
        link.send(SupervisorMessage::Started {
            worker_id: 3,
            port: 2326,
        });
        link.error("proxy 10.0.0.1:8080 timed out");
        drop(link);
        let bytes = writer.await.unwrap();

        let (first, n) = decode_frame(&bytes).unwrap();
        assert!(matches!(
            first,
            SupervisorMessage::Started {
                worker_id: 3,
                port: 2326
            }
        ));
        let (second, m) = decode_frame(&bytes[n..]).unwrap();
        assert_eq!(n + m, bytes.len());
        match second {
            SupervisorMessage::Error { worker_id, error } => {
                assert_eq!(worker_id, 3);
                assert!(error.contains("timed out"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disabled_link_drops_silently() {
        let link = SupervisorLink::disabled(0);
        link.error("ignored");
        assert_eq!(link.worker_id(), 0);
    }

    #[tokio::test]
    async fn stdout_writer_finishes_when_link_drops() {
        let (link, writer) = SupervisorLink::stdout(3);
        assert_eq!(link.worker_id(), 3);
        drop(link);
        tokio::time::timeout(std::time::Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\trelay-worker\nVmPeak:\t  9000 kB\nVmRSS:\t    2048 kB\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name: x\n"), None);
    }
}
