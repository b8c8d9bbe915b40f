//! Cancellable periodic tasks. A tick that is still running when the next
//! one is due causes that tick to be skipped, never queued.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Run `tick` every `period` (first run one period from now) until
/// `shutdown` flips or its sender is dropped.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            tokio::select! {
                _ = tick() => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(timer = name, "periodic task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn ticks_until_shutdown() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = spawn_periodic("test", Duration::from_millis(10), stop_rx, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {seen} ticks");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn slow_tick_is_not_queued() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (r, m) = (running.clone(), max_seen.clone());
        let handle = spawn_periodic("slow", Duration::from_millis(5), stop_rx, move || {
            let (r, m) = (r.clone(), m.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(25)).await;
                r.fetch_sub(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        drop(stop_tx);
        handle.await.unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
