//! Defines the `Consumer` side of a `skein` stream and the `Packet` it yields.
//!
//! A `Consumer` is a cursor into the shared log. It starts at the log's tail at
//! the moment it attached, so it never sees history, and advances one node per
//! delivered packet at its own pace. Nodes addressed to other consumers are
//! stepped over without being counted or returned.
//!
//! `next()` follows a pull protocol:
//!
//! 1. Rejoin the registry if the previous read timed out (the cursor is kept).
//! 2. A pending kill override wins over any unread data and ends the consumer.
//! 3. Otherwise advance to the next node addressed to this consumer, or suspend
//!    until a producer wakes us or the deadline passes.
//! 4. A terminal node (`done == true`) ends the consumer after it is returned.
//!
//! Once a consumer has ended, been detached or been evicted, every further call
//! returns [`Error::UnknownConsumer`].

use crate::error::Error;
use crate::registry::Slot;
use crate::Bus;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One delivery from the stream.
///
/// `done == true` marks the terminal result of a consumer: either a `close`
/// payload from the log or a kill override.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet<T> {
    /// The payload written by the producer.
    pub value: T,
    /// Whether this is the last packet this consumer will receive.
    pub done: bool,
}

impl<T> Packet<T> {
    pub(crate) fn data(value: T) -> Self {
        Self { value, done: false }
    }

    pub(crate) fn end(value: T) -> Self {
        Self { value, done: true }
    }

    /// Returns the payload, dropping the terminal flag.
    pub fn into_value(self) -> T {
        self.value
    }
}

/// Marks the slot as suspended for as long as it lives, so the reclaimer never
/// treats a waiting consumer as idle. Cleared on drop, which also covers a
/// `next()` future cancelled mid-wait.
struct Suspended<'a, T>(&'a Slot<T>);

impl<'a, T> Suspended<'a, T> {
    fn enter(slot: &'a Slot<T>) -> Self {
        slot.set_suspended(true);
        Self(slot)
    }
}

impl<T> Drop for Suspended<'_, T> {
    fn drop(&mut self) {
        self.0.set_suspended(false);
        self.0.touch();
    }
}

/// The reading end of a `skein` stream.
///
/// Obtained from [`Broadcaster::attach`](crate::Broadcaster::attach). Every
/// consumer has its own cursor and backpressure count; a slow consumer never
/// blocks the producer or other consumers.
///
/// `Consumer` is `Send` and `Sync`, but `next()` takes `&mut self`, so a single
/// consumer is always driven by one task at a time. That is what guarantees at
/// most one outstanding wait per consumer.
///
/// Dropping a `Consumer` detaches it.
#[derive(Debug)]
pub struct Consumer<T> {
    bus: Arc<Bus<T>>,
    slot: Arc<Slot<T>>,
}

impl<T> Consumer<T> {
    pub(crate) fn new(bus: Arc<Bus<T>>, slot: Arc<Slot<T>>) -> Self {
        Self { bus, slot }
    }

    /// This consumer's id, as used by the producer's targeted operations.
    pub fn id(&self) -> u64 {
        self.slot.id()
    }

    /// Default read deadline chosen at attach time.
    pub fn timeout(&self) -> Option<Duration> {
        self.slot.timeout()
    }

    /// Items written for this consumer and not yet read.
    pub fn backpressure(&self) -> usize {
        self.slot.backpressure.depth()
    }

    /// Whether the producer currently accounts for this consumer.
    ///
    /// `false` after a timed-out read (until the next `next()`), and for good
    /// after a terminal packet, `detach()` or eviction.
    pub fn is_attached(&self) -> bool {
        self.slot.is_registered()
    }

    /// Removes this consumer from the registry immediately.
    ///
    /// Idempotent. Any later `next()` returns [`Error::UnknownConsumer`].
    pub fn detach(&mut self) {
        if self.slot.is_retired() {
            return;
        }
        let tail = self.bus.log.lock();
        self.bus.registry.retire(&tail, &self.slot);
        tracing::debug!(consumer = self.slot.id(), "consumer detached");
    }

    /// Ends this consumer after a terminal packet.
    fn finish(&self) {
        let tail = self.bus.log.lock();
        self.bus.registry.retire(&tail, &self.slot);
    }

    /// Puts this consumer back into the active set if a timeout took it out.
    fn ensure_registered(&self) -> Result<(), Error> {
        if self.slot.is_registered() {
            return Ok(());
        }
        let id = self.slot.id();
        let tail = self.bus.log.lock();
        if !self.bus.registry.rejoin(&tail, &self.slot) {
            return Err(Error::UnknownConsumer { id });
        }
        tracing::trace!(consumer = id, "consumer rejoined");
        Ok(())
    }

    /// Consumes a pending kill override, if any.
    fn take_kill(&self) -> Option<Packet<T>> {
        let value = self.slot.kill.lock().take()?;
        self.finish();
        tracing::debug!(consumer = self.slot.id(), "kill override delivered");
        Some(Packet::end(value))
    }
}

impl<T: Clone> Consumer<T> {
    /// Steps the cursor to the next node addressed to this consumer.
    ///
    /// Returns `Ok(None)` when the cursor has caught up with the tail.
    fn advance(&self) -> Result<Option<Packet<T>>, Error> {
        let id = self.slot.id();
        let packet = {
            let mut cursor = self.slot.cursor.lock();
            let Some(mut node) = cursor.clone() else {
                return Err(Error::UnknownConsumer { id });
            };

            loop {
                let Some(next) = node.next().cloned() else {
                    *cursor = Some(node);
                    return Ok(None);
                };
                node = next;

                let Some(packet) = node.packet() else {
                    tracing::warn!(consumer = id, seq = node.seq(), "sentinel reached mid-log");
                    return Err(Error::InvariantViolation {
                        detail: format!("sentinel linked at seq {}", node.seq()),
                    });
                };
                if !node.is_for(id) {
                    continue;
                }

                let packet = packet.clone();
                self.slot.backpressure.decrement();
                *cursor = Some(node);
                break packet;
            }
        };

        if packet.done {
            self.finish();
            tracing::debug!(consumer = id, "close observed");
        }
        Ok(Some(packet))
    }

    /// Waits for the next packet, using the deadline chosen at attach time.
    ///
    /// # Returns
    ///
    /// * `Ok(packet)`: the next item written for this consumer. `packet.done`
    ///   is `true` for the terminal result, after which the consumer is finished.
    /// * `Err(Error::Timeout)`: nothing arrived before the deadline. The consumer
    ///   keeps its position; calling `next()` again resumes where it left off.
    /// * `Err(Error::UnknownConsumer)`: the consumer has already finished, was
    ///   detached, or was evicted as idle.
    ///
    /// # Cancellation Safety
    ///
    /// This method **is** cancellation safe. The cursor only moves when a packet
    /// is returned, so dropping the future while it waits loses nothing.
    pub async fn next(&mut self) -> Result<Packet<T>, Error> {
        self.pull(self.slot.timeout()).await
    }

    /// Like [`next`](Self::next), with an explicit deadline for this call only.
    pub async fn next_with_timeout(&mut self, timeout: Duration) -> Result<Packet<T>, Error> {
        self.pull(Some(timeout)).await
    }

    async fn pull(&mut self, timeout: Option<Duration>) -> Result<Packet<T>, Error> {
        let id = self.slot.id();
        self.ensure_registered()?;
        self.slot.touch();

        // A deadline past what `Instant` can represent means no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            if let Some(packet) = self.take_kill() {
                return Ok(packet);
            }
            if let Some(packet) = self.advance()? {
                return Ok(packet);
            }

            let waited = {
                let _suspended = Suspended::enter(&*self.slot);
                self.slot.waiter.wait_until(deadline).await
            };

            if waited.is_err() {
                return self.expire(timeout);
            }

            if self.slot.is_retired() {
                return Err(Error::UnknownConsumer { id });
            }
        }
    }

    /// Settles a read whose deadline passed.
    ///
    /// A wake may have raced the timer, so a kill or item delivered in between is
    /// still returned. Only when nothing is there does the consumer park.
    fn expire(&self, timeout: Option<Duration>) -> Result<Packet<T>, Error> {
        if let Some(packet) = self.take_kill() {
            return Ok(packet);
        }
        if let Some(packet) = self.advance()? {
            return Ok(packet);
        }

        let id = self.slot.id();
        let tail = self.bus.log.lock();
        self.bus.registry.park(&tail, &self.slot);
        tracing::trace!(consumer = id, "read timed out");
        Err(Error::Timeout {
            id,
            timeout: timeout.unwrap_or_default(),
        })
    }
}

impl<T> Drop for Consumer<T> {
    /// A dropped consumer leaves the registry and releases its cursor, so it no
    /// longer pins any part of the log.
    fn drop(&mut self) {
        self.detach();
    }
}
