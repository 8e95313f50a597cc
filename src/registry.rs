//! Consumer registry: one [`Slot`] per attached consumer.
//!
//! A slot carries everything the producer side needs to reach a consumer without
//! touching its handle: the saved cursor, the backpressure gauge, the wake slot
//! and the pending kill override.
//!
//! Slots live in one of two maps:
//!
//! - `active`: consumers the producer accounts for and wakes. This is what
//!   introspection reports and what unicast/kill operations can address.
//! - `parked`: consumers whose last read timed out. They keep their cursor so the
//!   next read resumes in place, but receive no accounting until they rejoin.
//!
//! Membership changes only happen while the caller holds the sequencer lock; the
//! `&Tail<T>` parameter on the mutating methods is the proof of that.

use crate::gauge::Gauge;
use crate::log::{Node, Tail};
use crate::waiter::Waiter;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of one consumer's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Consumer id.
    pub id: u64,
    /// Items written for this consumer and not yet read (a pending kill counts as one).
    pub backpressure: usize,
    /// Default read deadline chosen when the consumer attached.
    pub timeout: Option<Duration>,
}

/// Allocates consumer ids. Ids start at 1 and are never reused.
#[derive(Debug)]
pub(crate) struct ConsumerIds {
    id: CachePadded<AtomicU64>,
}

impl Default for ConsumerIds {
    fn default() -> Self {
        Self {
            id: CachePadded::new(AtomicU64::new(1)),
        }
    }
}

impl ConsumerIds {
    pub(crate) fn next_id(&self) -> u64 {
        self.id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Per-consumer state shared between the consumer handle and the producer side.
#[derive(Debug)]
pub(crate) struct Slot<T> {
    id: u64,
    timeout: Option<Duration>,
    /// Last node consumed. `None` once the consumer is retired.
    pub(crate) cursor: Mutex<Option<Arc<Node<T>>>>,
    pub(crate) backpressure: Gauge,
    pub(crate) waiter: Waiter,
    pub(crate) kill: Mutex<Option<T>>,
    registered: AtomicBool,
    retired: AtomicBool,
    suspended: AtomicBool,
    last_active: Mutex<Instant>,
}

impl<T> Slot<T> {
    pub(crate) fn new(id: u64, cursor: Arc<Node<T>>, timeout: Option<Duration>) -> Self {
        Self {
            id,
            timeout,
            cursor: Mutex::new(Some(cursor)),
            backpressure: Gauge::default(),
            waiter: Waiter::default(),
            kill: Mutex::new(None),
            registered: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[inline]
    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    pub(crate) fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_active.lock())
    }

    /// Sets or replaces the kill override. A pending override counts as exactly
    /// one unit of backpressure no matter how often it is replaced.
    pub(crate) fn arm_kill(&self, value: T) {
        if self.kill.lock().replace(value).is_none() {
            self.backpressure.increment();
        }
        self.waiter.wake();
    }

    pub(crate) fn has_kill(&self) -> bool {
        self.kill.lock().is_some()
    }

    /// Sequence number of the saved cursor, if the slot still has one.
    pub(crate) fn cursor_seq(&self) -> Option<u64> {
        self.cursor.lock().as_ref().map(|node| node.seq())
    }

    pub(crate) fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            id: self.id,
            backpressure: self.backpressure.depth(),
            timeout: self.timeout,
        }
    }

    /// Drops everything the slot holds on to. The consumer can never read again.
    fn clear(&self) {
        self.retired.store(true, Ordering::Release);
        self.registered.store(false, Ordering::Release);
        self.cursor.lock().take();
        self.kill.lock().take();
        self.backpressure.reset();
    }
}

#[derive(Debug)]
pub(crate) struct Registry<T> {
    ids: ConsumerIds,
    active: papaya::HashMap<u64, Arc<Slot<T>>>,
    parked: papaya::HashMap<u64, Arc<Slot<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            ids: ConsumerIds::default(),
            active: Default::default(),
            parked: Default::default(),
        }
    }
}

impl<T> Registry<T> {
    /// Creates a slot anchored at the current tail and registers it.
    pub(crate) fn attach(&self, tail: &Tail<T>, timeout: Option<Duration>) -> Arc<Slot<T>> {
        let id = self.ids.next_id();
        let slot = Arc::new(Slot::new(id, tail.node().clone(), timeout));
        slot.registered.store(true, Ordering::Release);
        self.active.pin().insert(id, slot.clone());
        slot
    }

    /// Moves a parked slot back into the active set, recomputing its backpressure
    /// from the saved cursor.
    ///
    /// Returns `false` if the slot has been retired in the meantime.
    pub(crate) fn rejoin(&self, _tail: &Tail<T>, slot: &Arc<Slot<T>>) -> bool {
        if slot.is_retired() {
            return false;
        }
        if slot.is_registered() {
            return true;
        }

        let pending = {
            let cursor = slot.cursor.lock();
            let Some(node) = cursor.as_ref() else {
                return false;
            };
            node.pending_for(slot.id)
        };
        let pending = i64::try_from(pending).unwrap_or(i64::MAX) + i64::from(slot.has_kill());
        slot.backpressure.store(pending);

        self.parked.pin().remove(&slot.id);
        slot.registered.store(true, Ordering::Release);
        self.active.pin().insert(slot.id, slot.clone());
        true
    }

    /// Takes a slot out of the active set but keeps its cursor.
    pub(crate) fn park(&self, _tail: &Tail<T>, slot: &Arc<Slot<T>>) {
        if slot.is_retired() {
            return;
        }
        self.active.pin().remove(&slot.id);
        slot.registered.store(false, Ordering::Release);
        self.parked.pin().insert(slot.id, slot.clone());
    }

    /// Removes a slot for good and releases its cursor.
    pub(crate) fn retire(&self, _tail: &Tail<T>, slot: &Slot<T>) {
        self.active.pin().remove(&slot.id);
        self.parked.pin().remove(&slot.id);
        slot.clear();
    }

    pub(crate) fn get(&self, id: u64) -> Option<Arc<Slot<T>>> {
        self.active.pin().get(&id).cloned()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.active.pin().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    /// Active slots, ordered by id.
    pub(crate) fn active(&self) -> Vec<Arc<Slot<T>>> {
        let mut slots: Vec<_> = self.active.pin().values().cloned().collect();
        slots.sort_by_key(|slot| slot.id);
        slots
    }

    /// Active and parked slots.
    pub(crate) fn all(&self) -> Vec<Arc<Slot<T>>> {
        let mut slots = self.active();
        slots.extend(self.parked.pin().values().cloned());
        slots
    }

    pub(crate) fn for_each_active(&self, mut f: impl FnMut(&Arc<Slot<T>>)) {
        for slot in self.active.pin().values() {
            f(slot);
        }
    }
}
