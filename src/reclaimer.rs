//! Bounds how much of the log stays in memory.
//!
//! Nodes are reference counted and the log only keeps its tail, so the prefix
//! behind the slowest cursor is freed on its own as cursors advance. What can
//! still pin memory forever is a consumer that stopped reading without being
//! dropped. A sweep evicts such consumers once they have been idle longer than
//! `Config::idle_timeout`, which releases their cursor, and reports the window
//! of the log that is still retained.
//!
//! Sweeps run under the sequencer lock, so they are ordered with respect to
//! attaches and appends: a consumer attached concurrently is either fully
//! registered (and counted) or not yet anchored at all.

use crate::Bus;
use crate::log::Tail;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Outcome of one reclaimer pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Consumers evicted as idle in this pass.
    pub evicted: Vec<u64>,
    /// Sequence number of the newest node in the log.
    pub head: u64,
    /// Sequence number of the oldest node some live cursor still points at.
    /// Equal to `head` when nothing older is retained.
    pub oldest_retained: u64,
}

impl SweepReport {
    /// Number of nodes kept alive behind the head by live cursors.
    pub fn retained(&self) -> u64 {
        self.head - self.oldest_retained
    }
}

pub(crate) fn sweep<T>(bus: &Bus<T>) -> SweepReport {
    let tail = bus.log.lock();
    sweep_locked(bus, &tail)
}

pub(crate) fn sweep_locked<T>(bus: &Bus<T>, tail: &Tail<T>) -> SweepReport {
    let now = Instant::now();
    let head = tail.node().seq();
    let mut report = SweepReport {
        evicted: Vec::new(),
        head,
        oldest_retained: head,
    };

    let idle_limit = bus.config.idle_limit();
    for slot in bus.registry.all() {
        let idle = slot.idle_for(now);
        if idle_limit.is_some_and(|limit| !slot.is_suspended() && idle > limit) {
            bus.registry.retire(tail, &slot);
            slot.waiter.wake();
            tracing::debug!(consumer = slot.id(), ?idle, "idle consumer evicted");
            report.evicted.push(slot.id());
            continue;
        }

        if let Some(seq) = slot.cursor_seq() {
            report.oldest_retained = report.oldest_retained.min(seq);
        }
    }

    report
}

pub(crate) fn spawn<T: Send + Sync + 'static>(bus: &Arc<Bus<T>>) -> Option<JoinHandle<()>> {
    let period = bus.config.sweep_period()?;
    let bus: Weak<Bus<T>> = Arc::downgrade(bus);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(bus) = bus.upgrade() else {
                break;
            };
            if bus.registry.all().is_empty() {
                continue;
            }
            let report = sweep(&bus);
            if !report.evicted.is_empty() {
                tracing::debug!(
                    evicted = report.evicted.len(),
                    retained = report.retained(),
                    "reclaimer pass"
                );
            }
        }
        tracing::trace!("reclaimer stopped");
    }))
}

#[cfg(test)]
mod tests {
    use crate::{Broadcaster, Config, Error};
    use std::time::Duration;

    fn idle_config(idle: Duration) -> Config {
        Config {
            idle_timeout: idle,
            sweep_interval: Duration::from_millis(10),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_retained_window_follows_slowest_cursor() {
        let tx = Broadcaster::<u32>::new();
        let mut fast = tx.attach();
        let slow = tx.attach();

        for i in 0..10 {
            tx.write(i);
        }
        for _ in 0..10 {
            fast.next().await.unwrap();
        }

        let report = tx.sweep();
        assert!(report.evicted.is_empty());
        assert_eq!(report.head, 10);
        assert_eq!(report.oldest_retained, 0);
        assert_eq!(report.retained(), 10);

        drop(slow);
        let report = tx.sweep();
        assert_eq!(report.oldest_retained, 10);
        assert_eq!(report.retained(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_consumer_is_evicted() {
        let tx = Broadcaster::<u32>::with_config(idle_config(Duration::from_millis(100)));
        let mut idle = tx.attach();
        let id = idle.id();

        tx.write(1);
        tokio::time::advance(Duration::from_millis(150)).await;

        let report = tx.sweep();
        assert_eq!(report.evicted, vec![id]);
        assert!(!tx.has_consumer(id));
        assert_eq!(report.retained(), 0);

        assert_eq!(idle.next().await, Err(Error::UnknownConsumer { id }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_active_consumer_survives() {
        let tx = Broadcaster::<u32>::with_config(idle_config(Duration::from_millis(100)));
        let mut rx = tx.attach();

        tx.write(1);
        tokio::time::advance(Duration::from_millis(80)).await;
        rx.next().await.unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;

        assert!(tx.sweep().evicted.is_empty());
        assert!(tx.has_consumer(rx.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_consumer_is_never_idle() {
        let tx = Broadcaster::<u32>::with_config(idle_config(Duration::from_millis(100)));
        let mut rx = tx.attach();
        let id = rx.id();

        let reader = tokio::spawn(async move { rx.next().await.map(|p| p.value) });
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(tx.sweep().evicted.is_empty());
        assert!(tx.has_consumer(id));

        tx.write(5);
        assert_eq!(reader.await.unwrap().unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_consumer_can_be_evicted() {
        let tx = Broadcaster::<u32>::with_config(idle_config(Duration::from_millis(100)));
        let mut rx = tx.attach_with_timeout(Some(Duration::from_millis(10)));
        let id = rx.id();

        assert!(rx.next().await.unwrap_err().is_timeout());
        tokio::time::advance(Duration::from_millis(200)).await;

        assert_eq!(tx.sweep().evicted, vec![id]);
        assert_eq!(rx.next().await, Err(Error::UnknownConsumer { id }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_on_write() {
        let tx = Broadcaster::<u32>::with_config(Config {
            idle_timeout: Duration::from_millis(100),
            reclaim_on_write: true,
            ..Config::default()
        });
        let rx = tx.attach();

        tokio::time::advance(Duration::from_millis(150)).await;
        tx.write(1);
        assert!(!tx.has_consumer(rx.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reclaimer_evicts_and_stops() {
        let tx = Broadcaster::<u32>::with_config(idle_config(Duration::from_millis(50)));
        let rx = tx.attach();
        let id = rx.id();

        let handle = tx.spawn_reclaimer().expect("sweep interval is set");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!tx.has_consumer(id));

        drop(rx);
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_background_task_without_interval() {
        let tx = Broadcaster::<u32>::with_config(Config {
            sweep_interval: Duration::ZERO,
            ..Config::default()
        });
        assert!(tx.spawn_reclaimer().is_none());
    }
}
