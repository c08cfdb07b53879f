//! # Error Handling for Spool
//!
//! This module defines the error types used throughout Spool. We use a single
//! error enum ([`Error`]) to represent all failure modes, which keeps function
//! signatures short and lets callers handle errors uniformly.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Storage | `Sqlite` | Logged internally; the engine retries on its next tick |
//! | Encoding | `Json` | Fix the payload; nothing was enqueued |
//! | Lifecycle | `Closed` | The engine was shut down; stop calling it |
//! | Internal | `Worker` | Thread spawn or channel plumbing failed at startup |
//!
//! Most storage errors never reach callers: the writer discards a failed
//! batch and keeps going, and subscribers retry on the next poll. What does
//! surface from the public API is either an encoding problem with the
//! caller's own payload or use of the engine after teardown.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in Spool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate: a locked database file, a
    /// full disk, corruption. Inside the engine this is treated as "store
    /// unavailable": the writer drops the affected batch and continues, and
    /// subscribers retry on their next poll.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A structured payload could not be encoded to JSON.
    ///
    /// Only produced by the typed publish entry points before anything is
    /// enqueued. The message was not accepted.
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),

    /// The engine (or one of its workers) has been shut down.
    ///
    /// Returned when an operation is attempted after `shutdown`, or when an
    /// internal worker channel is gone. Create a new engine instance if you
    /// need to continue.
    #[error("engine is shut down")]
    Closed,

    /// A worker thread could not be started or wired up.
    ///
    /// Only possible during construction. The contained message names the
    /// worker that failed.
    #[error("worker error: {0}")]
    Worker(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
