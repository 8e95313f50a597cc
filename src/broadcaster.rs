//! Defines the `Broadcaster`, the producer end of a `skein` stream.
//!
//! Every write appends one node to the shared log and then accounts for it:
//! each consumer the node is addressed to gets one unit of backpressure and a
//! wake. Accounting happens before the node is linked, so a consumer can never
//! read a node whose unit has not been counted yet.
//!
//! Kills do not touch the log at all. They set an override on the targeted
//! consumer's slot, which that consumer returns ahead of anything it has not
//! read yet. No other consumer can see it.

use crate::consumer::{Consumer, Packet};
use crate::error::Error;
use crate::reclaimer::{self, SweepReport};
use crate::registry::ConsumerStats;
use crate::{Bus, Config};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// The writing end of a `skein` stream.
///
/// `Broadcaster` is cheap to clone; clones share the same log and registry.
/// Writes from different clones are serialized, so every consumer observes one
/// total order of writes.
#[derive(Debug)]
pub struct Broadcaster<T> {
    bus: Arc<Bus<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Broadcaster<T> {
    /// Creates a broadcaster with [`Config::default`].
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a broadcaster with the given configuration.
    pub fn with_config(config: Config) -> Self {
        Self {
            bus: Arc::new(Bus::new(config)),
        }
    }

    /// The configuration this stream was created with.
    pub fn config(&self) -> &Config {
        &self.bus.config
    }

    /// Attaches a new consumer using the configured default read deadline.
    ///
    /// The consumer's cursor starts at the current tail: it receives everything
    /// written after this call returns and nothing written before.
    pub fn attach(&self) -> Consumer<T> {
        self.attach_with_timeout(self.bus.config.read_timeout())
    }

    /// Attaches a new consumer with its own default read deadline.
    pub fn attach_with_timeout(&self, timeout: Option<Duration>) -> Consumer<T> {
        let slot = {
            let tail = self.bus.log.lock();
            self.bus.registry.attach(&tail, timeout)
        };
        tracing::debug!(consumer = slot.id(), ?timeout, "consumer attached");
        Consumer::new(Arc::clone(&self.bus), slot)
    }

    /// Appends an item for every attached consumer.
    pub fn write(&self, value: T) {
        self.append(Packet::data(value), None);
    }

    /// Appends a terminal item for every attached consumer.
    ///
    /// Each consumer that reads it is finished afterwards. The stream itself stays
    /// open: consumers attached later see later writes.
    pub fn close(&self, value: T) {
        self.append(Packet::end(value), None);
    }

    /// Appends an item only consumer `id` will see.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownConsumer`] if `id` is not attached; nothing is appended.
    pub fn write_to_consumer(&self, id: u64, value: T) -> Result<(), Error> {
        self.append_to(id, Packet::data(value))
    }

    /// Appends a terminal item only consumer `id` will see.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownConsumer`] if `id` is not attached; nothing is appended.
    pub fn close_consumer(&self, id: u64, value: T) -> Result<(), Error> {
        self.append_to(id, Packet::end(value))
    }

    /// Ends every attached consumer with `value`, ahead of anything unread.
    ///
    /// Returns the number of consumers targeted.
    pub fn kill(&self, value: T) -> usize {
        let _tail = self.bus.log.lock();
        let mut killed = 0;
        self.bus.registry.for_each_active(|slot| {
            slot.arm_kill(value.clone());
            killed += 1;
        });
        tracing::debug!(consumers = killed, "kill broadcast");
        killed
    }

    /// Ends consumer `id` with `value`, ahead of anything it has not read yet.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownConsumer`] if `id` is not attached.
    pub fn kill_consumer(&self, id: u64, value: T) -> Result<(), Error> {
        let _tail = self.bus.log.lock();
        let slot = self
            .bus
            .registry
            .get(id)
            .ok_or(Error::UnknownConsumer { id })?;
        slot.arm_kill(value);
        tracing::debug!(consumer = id, "kill armed");
        Ok(())
    }

    fn append(&self, packet: Packet<T>, affinity: Option<u64>) {
        let mut tail = self.bus.log.lock();
        let node = tail.prepare(packet, affinity);

        self.bus.registry.for_each_active(|slot| {
            slot.backpressure.increment();
        });
        tail.link(node);
        self.bus.registry.for_each_active(|slot| {
            slot.waiter.wake();
        });
        tracing::trace!(seq = tail.node().seq(), "appended");

        if self.bus.config.reclaim_on_write {
            reclaimer::sweep_locked(&self.bus, &tail);
        }
    }

    fn append_to(&self, id: u64, packet: Packet<T>) -> Result<(), Error> {
        let mut tail = self.bus.log.lock();
        let slot = self
            .bus
            .registry
            .get(id)
            .ok_or(Error::UnknownConsumer { id })?;

        let node = tail.prepare(packet, Some(id));
        slot.backpressure.increment();
        tail.link(node);
        slot.waiter.wake();
        tracing::trace!(consumer = id, seq = tail.node().seq(), "appended to consumer");

        if self.bus.config.reclaim_on_write {
            reclaimer::sweep_locked(&self.bus, &tail);
        }
        Ok(())
    }

    /// Items written for consumer `id` and not yet read.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownConsumer`] if `id` is not attached.
    pub fn backpressure(&self, id: u64) -> Result<usize, Error> {
        self.consumer_stats(id).map(|stats| stats.backpressure)
    }

    /// The largest backpressure across attached consumers, or 0 with none.
    pub fn max_backpressure(&self) -> usize {
        let mut max = 0;
        self.bus.registry.for_each_active(|slot| {
            max = max.max(slot.backpressure.depth());
        });
        max
    }

    /// # Errors
    ///
    /// [`Error::UnknownConsumer`] if `id` is not attached.
    pub fn consumer_stats(&self, id: u64) -> Result<ConsumerStats, Error> {
        self.bus
            .registry
            .get(id)
            .map(|slot| slot.stats())
            .ok_or(Error::UnknownConsumer { id })
    }

    /// Stats for every attached consumer, ordered by id.
    pub fn list_consumer_stats(&self) -> Vec<ConsumerStats> {
        self.bus
            .registry
            .active()
            .iter()
            .map(|slot| slot.stats())
            .collect()
    }

    /// Whether consumer `id` is attached and accounted for.
    pub fn has_consumer(&self, id: u64) -> bool {
        self.bus.registry.contains(id)
    }

    /// Number of attached consumers.
    pub fn consumer_count(&self) -> usize {
        self.bus.registry.len()
    }

    /// Ids of attached consumers, ascending.
    pub fn consumer_ids(&self) -> Vec<u64> {
        self.bus
            .registry
            .active()
            .iter()
            .map(|slot| slot.id())
            .collect()
    }

    /// Runs one reclaimer pass now.
    pub fn sweep(&self) -> SweepReport {
        reclaimer::sweep(&self.bus)
    }

    /// Starts the background reclaimer on the current Tokio runtime.
    ///
    /// Returns `None` when `Config::sweep_interval` is zero. The task ends on its
    /// own once every broadcaster and consumer handle has been dropped.
    pub fn spawn_reclaimer(&self) -> Option<JoinHandle<()>> {
        reclaimer::spawn(&self.bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_round_trip_close_then_new_cycle() {
        let tx = Broadcaster::<&str>::new();

        let mut first = tx.attach();
        for item in ["a", "b", "c"] {
            tx.write(item);
        }
        tx.close("end1");

        let mut seen = Vec::new();
        loop {
            let packet = first.next().await.unwrap();
            if packet.done {
                assert_eq!(packet.value, "end1");
                break;
            }
            seen.push(packet.value);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);

        let mut second = tx.attach();
        tx.write("d");
        tx.write("e");
        tx.close("end2");

        let mut seen = Vec::new();
        loop {
            let packet = second.next().await.unwrap();
            if packet.done {
                assert_eq!(packet.value, "end2");
                break;
            }
            seen.push(packet.value);
        }
        assert_eq!(seen, vec!["d", "e"]);
        assert!(tx.list_consumer_stats().is_empty());
    }

    #[tokio::test]
    async fn test_kill_while_suspended_leaves_others_running() {
        let tx = Broadcaster::<String>::new();
        let mut a = tx.attach();
        let mut b = tx.attach();
        let a_id = a.id();
        let b_id = b.id();

        let a_task = tokio::spawn(async move { a.next().await });
        tokio::task::yield_now().await;

        tx.kill_consumer(a_id, "stop".to_string()).unwrap();

        let packet = timeout(Duration::from_millis(500), a_task)
            .await
            .expect("kill should wake the suspended consumer")
            .unwrap()
            .unwrap();
        assert_eq!(packet, Packet::end("stop".to_string()));

        let stats = tx.list_consumer_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].id, b_id);

        tx.write("x".to_string());
        tx.write("y".to_string());
        assert_eq!(b.next().await.unwrap().value, "x");
        assert_eq!(b.next().await.unwrap().value, "y");
    }

    #[tokio::test]
    async fn test_unicast_does_not_touch_other_consumers() {
        let tx = Broadcaster::<u32>::new();
        let mut a = tx.attach();
        let mut b = tx.attach();

        tx.write_to_consumer(a.id(), 1).unwrap();
        assert_eq!(tx.backpressure(a.id()).unwrap(), 1);
        assert_eq!(tx.backpressure(b.id()).unwrap(), 0);

        assert_eq!(a.next().await.unwrap().value, 1);
        assert!(timeout(Duration::from_millis(20), b.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_consumer_ends_only_target() {
        let tx = Broadcaster::<u32>::new();
        let mut a = tx.attach();
        let b = tx.attach();

        tx.close_consumer(a.id(), 0).unwrap();
        let packet = a.next().await.unwrap();
        assert!(packet.done);
        assert!(!tx.has_consumer(a.id()));
        assert!(tx.has_consumer(b.id()));
    }

    #[tokio::test]
    async fn test_targeted_ops_reject_unknown_ids() {
        let tx = Broadcaster::<u32>::new();
        assert_eq!(
            tx.write_to_consumer(77, 1),
            Err(Error::UnknownConsumer { id: 77 })
        );
        assert_eq!(
            tx.close_consumer(77, 1),
            Err(Error::UnknownConsumer { id: 77 })
        );
        assert_eq!(
            tx.kill_consumer(77, 1),
            Err(Error::UnknownConsumer { id: 77 })
        );
        assert_eq!(tx.backpressure(77), Err(Error::UnknownConsumer { id: 77 }));
        assert!(tx.consumer_stats(77).is_err());
        assert!(!tx.has_consumer(77));
    }

    #[tokio::test]
    async fn test_kill_counts_as_one_unit() {
        let tx = Broadcaster::<u32>::new();
        let rx = tx.attach();
        let id = rx.id();

        tx.write(1);
        tx.kill_consumer(id, 100).unwrap();
        tx.kill_consumer(id, 200).unwrap();

        assert_eq!(tx.backpressure(id).unwrap(), 2);
        assert_eq!(tx.max_backpressure(), 2);
    }

    #[tokio::test]
    async fn test_global_kill_targets_every_consumer() {
        let tx = Broadcaster::<&str>::new();
        let mut a = tx.attach();
        let mut b = tx.attach();

        assert_eq!(tx.kill("shutdown"), 2);
        assert_eq!(a.next().await.unwrap(), Packet::end("shutdown"));
        assert_eq!(b.next().await.unwrap(), Packet::end("shutdown"));
        assert_eq!(tx.consumer_count(), 0);
        assert_eq!(tx.kill("again"), 0);
    }

    #[tokio::test]
    async fn test_attach_after_close_sees_later_writes() {
        let tx = Broadcaster::<u32>::new();
        tx.close(0);

        let mut rx = tx.attach();
        tx.write(1);
        tx.close(2);

        assert_eq!(rx.next().await.unwrap(), Packet::data(1));
        assert_eq!(rx.next().await.unwrap(), Packet::end(2));
    }

    #[tokio::test]
    async fn test_introspection() {
        let tx = Broadcaster::<u32>::new();
        assert_eq!(tx.max_backpressure(), 0);

        let a = tx.attach_with_timeout(Some(Duration::from_secs(1)));
        let mut b = tx.attach();

        tx.write(1);
        tx.write(2);
        b.next().await.unwrap();

        assert_eq!(tx.consumer_ids(), vec![a.id(), b.id()]);
        assert_eq!(tx.consumer_count(), 2);
        assert_eq!(tx.max_backpressure(), 2);
        assert_eq!(
            tx.list_consumer_stats(),
            vec![
                ConsumerStats {
                    id: a.id(),
                    backpressure: 2,
                    timeout: Some(Duration::from_secs(1)),
                },
                ConsumerStats {
                    id: b.id(),
                    backpressure: 1,
                    timeout: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_registry_empty_after_all_finish() {
        let tx = Broadcaster::<u32>::new();
        let mut a = tx.attach();
        let mut b = tx.attach();
        let mut c = tx.attach();

        tx.close(0);
        a.next().await.unwrap();
        b.detach();
        tx.kill_consumer(c.id(), 1).unwrap();
        c.next().await.unwrap();

        assert!(tx.list_consumer_stats().is_empty());
        assert_eq!(tx.consumer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_see_every_write_in_order() {
        let tx = Broadcaster::<u32>::new();
        let mut readers = Vec::new();

        for _ in 0..4 {
            let mut rx = tx.attach();
            readers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    let packet = rx.next().await.unwrap();
                    if packet.done {
                        return seen;
                    }
                    seen.push(packet.value);
                }
            }));
        }

        let writer = {
            let tx = tx.clone();
            tokio::spawn(async move {
                for i in 0..1_000 {
                    tx.write(i);
                    if i % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                tx.close(u32::MAX);
            })
        };
        writer.await.unwrap();

        let expected: Vec<u32> = (0..1_000).collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), expected);
        }
        assert_eq!(tx.consumer_count(), 0);
    }
}
