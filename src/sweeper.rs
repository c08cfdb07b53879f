//! # Retention Sweeper
//!
//! An idempotent retention job, not a long-running component. The host's
//! scheduler is expected to invoke [`Sweeper::run`] periodically; each run
//! removes delivered messages past the delivered-retention window and
//! undelivered messages past the undelivered-retention window, in one
//! transaction.
//!
//! Undelivered messages are kept much longer than delivered ones (24 hours
//! against 1 hour by default) so a client that reconnects late can still
//! replay its backlog.

use std::time::Duration;

use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::store::Store;
use crate::types::current_time_ms;

/// What a sweep removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Delivered messages removed.
    pub delivered_removed: usize,

    /// Undelivered messages removed.
    pub undelivered_removed: usize,
}

/// The retention job.
pub struct Sweeper {
    store: Store,
    delivered_retention: Duration,
    undelivered_retention: Duration,
}

impl Sweeper {
    /// Creates a sweeper over the given store with the configured retention
    /// windows.
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            store,
            delivered_retention: config.delivered_retention,
            undelivered_retention: config.undelivered_retention,
        }
    }

    /// Runs one sweep.
    ///
    /// Both deletes execute under a single transaction. A row is only
    /// removed once it is outside its window: delivered rows by their
    /// delivery time, undelivered rows by their creation time.
    pub async fn run(&self) -> Result<SweepReport> {
        let now = current_time_ms();
        let delivered_cutoff = now.saturating_sub(self.delivered_retention.as_millis() as u64);
        let undelivered_cutoff = now.saturating_sub(self.undelivered_retention.as_millis() as u64);

        let (delivered_removed, undelivered_removed) =
            self.store.sweep(delivered_cutoff, undelivered_cutoff).await?;

        debug!(
            delivered_removed,
            undelivered_removed, "retention sweep complete"
        );

        Ok(SweepReport {
            delivered_removed,
            undelivered_removed,
        })
    }
}
