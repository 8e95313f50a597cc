//! # Stream configuration.
//!
//! ## Sentinel values
//! - `timeout = 0s` → reads wait forever
//! - `idle_timeout = 0s` → idle consumers are never evicted
//! - `sweep_interval = 0s` → no background reclaimer task

use std::time::Duration;

/// Settings shared by a [`Broadcaster`](crate::Broadcaster) and every consumer
/// attached to it.
#[derive(Clone, Debug)]
pub struct Config {
    /// Default per-read deadline for consumers created with `attach()`.
    ///
    /// - `Duration::ZERO` = no deadline
    /// - `> 0` = each suspended `next()` fails with `Error::Timeout` after this long
    pub timeout: Duration,

    /// How long a consumer may go without pulling before the reclaimer evicts it.
    ///
    /// Suspended consumers are never considered idle.
    pub idle_timeout: Duration,

    /// Tick period of the background reclaimer started by
    /// `Broadcaster::spawn_reclaimer`.
    pub sweep_interval: Duration,

    /// Run a reclaimer sweep right after every append.
    pub reclaim_on_write: bool,
}

impl Config {
    /// Default read deadline as an `Option`.
    #[inline]
    pub fn read_timeout(&self) -> Option<Duration> {
        non_zero(self.timeout)
    }

    /// Idle eviction threshold as an `Option`.
    #[inline]
    pub fn idle_limit(&self) -> Option<Duration> {
        non_zero(self.idle_timeout)
    }

    /// Background sweep period as an `Option`.
    #[inline]
    pub fn sweep_period(&self) -> Option<Duration> {
        non_zero(self.sweep_interval)
    }
}

#[inline]
fn non_zero(d: Duration) -> Option<Duration> {
    if d == Duration::ZERO { None } else { Some(d) }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `timeout = 0s` (wait forever)
    /// - `idle_timeout = 0s` (never evict)
    /// - `sweep_interval = 1s`
    /// - `reclaim_on_write = false`
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            sweep_interval: Duration::from_secs(1),
            reclaim_on_write: false,
        }
    }
}
