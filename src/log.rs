//! The shared append-only log.
//!
//! The log is a singly linked list of immutable [`Node`]s. Each node's `next`
//! link is a write-once cell: it is set exactly once, when its successor is
//! appended, and never changes afterwards. Readers only ever follow links, so
//! any number of cursors can walk the list concurrently without locking.
//!
//! The log itself keeps only the tail. Every older node is owned by whoever
//! still points at it (a cursor or a predecessor), which means a node is freed as
//! soon as the slowest cursor has moved past it.
//!
//! Appends are serialized by the [`Sequencer`] lock. Holding the lock is also how
//! the rest of the crate makes "append and account" or "attach at the tail" a
//! single indivisible step.

use crate::consumer::Packet;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// One entry in the shared log.
pub(crate) struct Node<T> {
    seq: u64,
    /// `None` only for the sentinel the log starts with.
    packet: Option<Packet<T>>,
    affinity: Option<u64>,
    next: OnceCell<Arc<Node<T>>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            seq: 0,
            packet: None,
            affinity: None,
            next: OnceCell::new(),
        }
    }

    #[inline]
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub(crate) fn packet(&self) -> Option<&Packet<T>> {
        self.packet.as_ref()
    }

    #[inline]
    pub(crate) fn next(&self) -> Option<&Arc<Node<T>>> {
        self.next.get()
    }

    #[inline]
    pub(crate) fn is_terminal(&self) -> bool {
        self.packet.as_ref().is_some_and(|p| p.done)
    }

    /// Whether consumer `id` should receive this node.
    #[inline]
    pub(crate) fn is_for(&self, id: u64) -> bool {
        self.packet.is_some() && self.affinity.is_none_or(|target| target == id)
    }

    /// Number of nodes after `self` that consumer `id` has yet to receive.
    pub(crate) fn pending_for(&self, id: u64) -> usize {
        let mut count = 0;
        let mut cur = self.next();
        while let Some(node) = cur {
            if node.is_for(id) {
                count += 1;
            }
            cur = node.next();
        }
        count
    }
}

// Printing a node must not walk the rest of the chain.
impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("seq", &self.seq)
            .field("affinity", &self.affinity)
            .field("terminal", &self.is_terminal())
            .field("linked", &self.next.initialized())
            .finish()
    }
}

impl<T> Drop for Node<T> {
    // Unlink the chain iteratively; the default recursive drop would overflow the
    // stack on a long backlog.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::into_inner(node) {
                Some(mut node) => next = node.next.take(),
                None => break,
            }
        }
    }
}

/// Mutable state behind the sequencer lock.
#[derive(Debug)]
pub(crate) struct Tail<T> {
    node: Arc<Node<T>>,
}

impl<T> Tail<T> {
    /// The most recently appended node.
    #[inline]
    pub(crate) fn node(&self) -> &Arc<Node<T>> {
        &self.node
    }

    /// Builds the node that will follow the current tail.
    ///
    /// The node is not visible to readers until [`Tail::link`] is called, which
    /// lets the caller account for it first.
    pub(crate) fn prepare(&self, packet: Packet<T>, affinity: Option<u64>) -> Arc<Node<T>> {
        Arc::new(Node {
            seq: self.node.seq + 1,
            packet: Some(packet),
            affinity,
            next: OnceCell::new(),
        })
    }

    /// Publishes `node` as the successor of the current tail.
    pub(crate) fn link(&mut self, node: Arc<Node<T>>) {
        // The tail's link is empty by construction: only this method sets it, and
        // it immediately moves the tail forward.
        if self.node.next.set(node.clone()).is_err() {
            tracing::warn!(seq = self.node.seq, "log tail already linked");
        }
        self.node = node;
    }
}

/// Serializes appends and registry membership changes.
#[derive(Debug)]
pub(crate) struct Sequencer<T> {
    tail: Mutex<Tail<T>>,
}

impl<T> Default for Sequencer<T> {
    fn default() -> Self {
        Self {
            tail: Mutex::new(Tail {
                node: Arc::new(Node::sentinel()),
            }),
        }
    }
}

impl<T> Sequencer<T> {
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, Tail<T>> {
        self.tail.lock()
    }
}
