use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI64, Ordering};

/// Outstanding-work counter for one consumer.
///
/// Writers bump it from the producer side while the owning consumer drains it,
/// so it lives on its own cache line.
#[derive(Debug, Default)]
pub(crate) struct Gauge {
    value: CachePadded<AtomicI64>,
}

impl Gauge {
    #[inline]
    pub(crate) fn increment(&self) -> i64 {
        self.value.fetch_add(1, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn decrement(&self) -> i64 {
        self.value.fetch_sub(1, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn store(&self, val: i64) {
        self.value.store(val, Ordering::Release);
    }

    #[inline]
    pub(crate) fn reset(&self) {
        self.store(0);
    }

    #[inline]
    pub(crate) fn relaxed(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Current depth, clamped at zero.
    #[inline]
    pub(crate) fn depth(&self) -> usize {
        usize::try_from(self.value.load(Ordering::Acquire)).unwrap_or(0)
    }
}

impl PartialEq<i64> for Gauge {
    fn eq(&self, other: &i64) -> bool {
        self.relaxed() == *other
    }
}
