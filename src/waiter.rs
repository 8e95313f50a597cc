//! Single-slot wake primitive used by a suspended consumer.
//!
//! Each registry slot owns exactly one `Waiter`, and only the consumer that owns
//! the slot ever waits on it, so at most one wake is ever outstanding per
//! consumer. `Notify::notify_one` stores a permit when nobody is waiting, which
//! closes the gap between "checked for a successor" and "started waiting": a
//! write landing in between is never lost, at worst it causes one extra loop
//! through the traversal.

use tokio::sync::Notify;
use tokio::time::{Instant, error::Elapsed};

#[derive(Debug, Default)]
pub(crate) struct Waiter {
    notify: Notify,
}

impl Waiter {
    /// Wakes the owning consumer if it is suspended, otherwise leaves a permit
    /// for its next wait.
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    /// Suspends until woken or until `deadline` passes.
    ///
    /// The timer is owned by the returned future, so it is dropped together with
    /// it on the wake path and never outlives the wait.
    pub(crate) async fn wait_until(&self, deadline: Option<Instant>) -> Result<(), Elapsed> {
        let notified = self.notify.notified();
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, notified).await,
            None => {
                notified.await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn test_wake_before_wait_is_not_lost() {
        let waiter = Waiter::default();
        waiter.wake();

        // The stored permit completes the wait immediately.
        timeout(Duration::from_millis(50), waiter.wait_until(None))
            .await
            .expect("stored permit should complete the wait")
            .unwrap();
    }

    #[tokio::test]
    async fn test_repeated_wakes_collapse_into_one_permit() {
        let waiter = Waiter::default();
        waiter.wake();
        waiter.wake();

        waiter.wait_until(None).await.unwrap();

        assert!(
            timeout(Duration::from_millis(20), waiter.wait_until(None))
                .await
                .is_err(),
            "second wait should stay pending"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses() {
        let waiter = Waiter::default();
        let deadline = Instant::now() + Duration::from_millis(100);
        assert!(waiter.wait_until(Some(deadline)).await.is_err());
    }

    #[tokio::test]
    async fn test_wake_from_other_task() {
        let waiter = Arc::new(Waiter::default());

        let w = waiter.clone();
        let task = tokio::spawn(async move { w.wait_until(None).await });

        tokio::task::yield_now().await;
        waiter.wake();

        timeout(Duration::from_millis(500), task)
            .await
            .expect("waiter should be woken")
            .unwrap()
            .unwrap();
    }
}
