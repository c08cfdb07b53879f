//! # Configuration
//!
//! All tuning knobs for the engine live in one [`Config`] struct with
//! sensible defaults. Every field is public; overrides use struct-update
//! syntax:
//!
//! ```rust
//! use std::time::Duration;
//! use spool::Config;
//!
//! let config = Config {
//!     batch_size: 50,
//!     polling_interval: Duration::from_millis(10),
//!     ..Config::default()
//! };
//! ```
//!
//! There is deliberately no CLI or environment-variable layer here. The host
//! application owns how configuration is sourced; the engine only consumes
//! the resolved values.

use std::time::Duration;

/// Configuration for the pub/sub engine.
///
/// The defaults are production values. Tests typically shrink
/// `polling_interval` and `flush_interval` to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum messages per batch insert (default: 200).
    pub batch_size: usize,

    /// Upper bound on how long the writer holds a partial batch open before
    /// inserting it (default: 50 ms). Shorter means lower latency, longer
    /// means fewer round-trips under sustained load.
    pub flush_interval: Duration,

    /// How long a subscriber sleeps between empty polls (default: 100 ms).
    pub polling_interval: Duration,

    /// Advisory upper bound for host HTTP handlers holding a streaming
    /// connection open (default: 30 s). The engine itself does not enforce
    /// this; it is carried for the host to read.
    pub max_wait_time: Duration,

    /// Capacity of the writer's in-memory intake queue (default: 10,000).
    /// When the queue is full, `broadcast` fails fast instead of blocking.
    pub max_queue_size: usize,

    /// Maximum time `shutdown` waits for the writer to drain its queue
    /// (default: 5 s). Messages still in memory after the deadline are lost
    /// and their count is logged.
    pub shutdown_timeout: Duration,

    /// Maximum time `flush` blocks waiting for its sentinel to be observed
    /// (default: 1 s).
    pub flush_timeout: Duration,

    /// How long delivered messages are retained before the sweeper removes
    /// them (default: 1 hour).
    pub delivered_retention: Duration,

    /// How long undelivered messages are retained before the sweeper removes
    /// them (default: 24 hours).
    pub undelivered_retention: Duration,

    /// Maximum consecutive poll failures a subscriber tolerates before
    /// stopping itself. `None` retries forever (default). Tests set a small
    /// value so a broken store surfaces quickly.
    pub poll_retry_limit: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 200,
            flush_interval: Duration::from_millis(50),
            polling_interval: Duration::from_millis(100),
            max_wait_time: Duration::from_secs(30),
            max_queue_size: 10_000,
            shutdown_timeout: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(1),
            delivered_retention: Duration::from_secs(3_600),
            undelivered_retention: Duration::from_secs(86_400),
            poll_retry_limit: None,
        }
    }
}
