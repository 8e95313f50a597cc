//! # skein
//!
//! A broadcast log with independent per-consumer cursors.
//!
//! One producer appends items to a shared, append-only log; any number of
//! consumers read it concurrently, each at its own pace, each seeing only what
//! was written after it attached. The producer can see how far behind every
//! consumer is, address items to a single consumer, and end a single consumer
//! early with a kill payload that jumps ahead of its unread backlog.
//!
//! ```text
//!   Broadcaster ── write / close ──► [sentinel]─►[a]─►[b]─►[c]─►[end]   (shared log)
//!        │                                       ▲          ▲
//!        │ kill_consumer / write_to_consumer     │          │
//!        ▼                                    cursor 1   cursor 2
//!   Registry { id → Slot { cursor, backpressure, waiter, kill } }
//! ```
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let tx = skein::Broadcaster::<&str>::new();
//! let mut rx = tx.attach();
//!
//! tx.write("hello");
//! tx.close("bye");
//!
//! assert_eq!(rx.next().await.unwrap().value, "hello");
//! let last = rx.next().await.unwrap();
//! assert!(last.done);
//! # }
//! ```

mod broadcaster;
mod config;
mod consumer;
mod error;
mod gauge;
mod log;
mod reclaimer;
mod registry;
mod waiter;

pub use crate::broadcaster::Broadcaster;
pub use crate::config::Config;
pub use crate::consumer::{Consumer, Packet};
pub use crate::error::Error;
pub use crate::reclaimer::SweepReport;
pub use crate::registry::ConsumerStats;

use crate::log::Sequencer;
use crate::registry::Registry;

/// Shared state behind every broadcaster and consumer handle.
#[derive(Debug)]
struct Bus<T> {
    config: Config,
    log: Sequencer<T>,
    registry: Registry<T>,
}

impl<T> Bus<T> {
    fn new(config: Config) -> Self {
        Self {
            config,
            log: Sequencer::default(),
            registry: Registry::default(),
        }
    }
}

/// Creates a broadcaster together with a first consumer attached to it.
pub fn channel<T: Clone + Send + Sync + 'static>(config: Config) -> (Broadcaster<T>, Consumer<T>) {
    let tx = Broadcaster::with_config(config);
    let rx = tx.attach();
    (tx, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_channel_attaches_first_consumer() {
        let (tx, mut rx) = channel::<String>(Config {
            timeout: Duration::from_secs(2),
            ..Config::default()
        });

        assert_eq!(tx.config().read_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(rx.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(tx.consumer_ids(), vec![rx.id()]);

        tx.write("first".to_string());
        assert_eq!(rx.next().await.unwrap().into_value(), "first");
    }
}
