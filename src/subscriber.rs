//! # Per-Session Subscriber
//!
//! One `Subscriber` drives delivery for one session: it tails the message
//! log, hands each new row to every registered callback, and marks rows
//! delivered once all callbacks have seen them.
//!
//! ## Poll Cycle
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ loop while running:                                        │
//! │   rows = fetch_undelivered(session, cursor, 100)           │
//! │   empty?  → sleep polling_interval, retry                  │
//! │   else    → for each row (ascending id):                   │
//! │               invoke every callback (panics isolated)      │
//! │               cursor = row.id                              │
//! │             mark_delivered(all fetched ids)                │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Semantics
//!
//! The cursor is strictly increasing for the lifetime of a subscriber, so
//! within one lifetime no callback sees the same id twice. Rows are marked
//! delivered only after the whole poll batch has been dispatched; a crash
//! between dispatch and mark means a later subscriber re-delivers those
//! rows. Callbacks must tolerate duplicates across subscriber lifetimes,
//! never within one.
//!
//! The cursor starts at zero: a freshly started subscriber first drains
//! whatever undelivered backlog exists for its session.
//!
//! ## Callback Isolation
//!
//! A panicking callback is caught and logged per invocation. The other
//! callbacks still receive the row, the cursor still advances, and the row
//! is still marked delivered. One broken listener must not stall a session.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::store::Store;
use crate::types::{Message, MessageEvent, MessageId, SessionId};

// =============================================================================
// Callbacks
// =============================================================================

/// Callback type for message delivery.
///
/// Invoked once per message, in ascending id order, with the payload passed
/// through verbatim. Must be cheap or hand off to its own task: the poll
/// loop invokes callbacks inline.
pub type MessageCallback = Box<dyn Fn(MessageEvent) + Send + Sync + 'static>;

/// The shared, concurrently updatable list of callbacks for one session.
///
/// Owned by the hub; the subscriber only reads it. Registrations added while
/// the subscriber is running take effect on the next dispatched row.
pub type CallbackList = Arc<RwLock<Vec<MessageCallback>>>;

// =============================================================================
// Configuration
// =============================================================================

/// Maximum rows fetched per poll.
const POLL_BATCH_LIMIT: usize = 100;

/// Bounded wait for the poll task to finish after `stop`.
const STOP_WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Subscriber
// =============================================================================

/// The delivery loop for a single session.
pub struct Subscriber {
    session_id: SessionId,
    store: Store,
    callbacks: CallbackList,
    polling_interval: Duration,
    poll_retry_limit: Option<u32>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscriber {
    /// Creates a subscriber for a session. Does not start polling;
    /// call [`start`](Self::start).
    pub fn new(
        session_id: SessionId,
        store: Store,
        callbacks: CallbackList,
        config: &Config,
    ) -> Self {
        Self {
            session_id,
            store,
            callbacks,
            polling_interval: config.polling_interval,
            poll_retry_limit: config.poll_retry_limit,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Launches the poll loop if it is not already running. Idempotent.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        self.running.store(true, Ordering::SeqCst);

        let session_id = self.session_id.clone();
        let store = self.store.clone();
        let callbacks = Arc::clone(&self.callbacks);
        let polling_interval = self.polling_interval;
        let poll_retry_limit = self.poll_retry_limit;
        let running = Arc::clone(&self.running);

        self.handle = Some(tokio::spawn(run_poll_loop(
            session_id,
            store,
            callbacks,
            polling_interval,
            poll_retry_limit,
            running,
        )));

        info!(session_id = %self.session_id, "subscriber started");
    }

    /// Signals the loop to exit and waits (bounded) for it. Idempotent.
    ///
    /// The wait is cooperative: an in-flight store call is allowed to finish
    /// and the loop exits at its next iteration boundary. There is no hard
    /// kill; on timeout the task is left to finish on its own and a warning
    /// is logged.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            tokio::select! {
                _ = handle => {
                    debug!(session_id = %self.session_id, "subscriber stopped");
                }
                _ = tokio::time::sleep(STOP_WAIT) => {
                    warn!(session_id = %self.session_id, "subscriber did not stop in time");
                }
            }
        }
    }

    /// Returns true while the poll loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// The session this subscriber serves.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

// =============================================================================
// Poll Loop
// =============================================================================

/// The polling delivery loop for one session.
async fn run_poll_loop(
    session_id: SessionId,
    store: Store,
    callbacks: CallbackList,
    polling_interval: Duration,
    poll_retry_limit: Option<u32>,
    running: Arc<AtomicBool>,
) {
    debug!(
        session_id = %session_id,
        interval_ms = polling_interval.as_millis() as u64,
        "subscriber poll loop started"
    );

    let mut cursor = MessageId::NONE;
    let mut consecutive_failures: u32 = 0;

    while running.load(Ordering::SeqCst) {
        match store
            .fetch_undelivered(&session_id, cursor, POLL_BATCH_LIMIT)
            .await
        {
            Ok(rows) if rows.is_empty() => {
                tokio::time::sleep(polling_interval).await;
            }
            Ok(rows) => {
                consecutive_failures = 0;

                let mut delivered = Vec::with_capacity(rows.len());
                for row in &rows {
                    dispatch_row(&session_id, &callbacks, row);
                    cursor = row.id;
                    delivered.push(row.id);
                }

                if let Err(e) = store.mark_delivered(delivered).await {
                    // The cursor has already moved past these rows, so this
                    // subscriber will not re-dispatch them; a future
                    // subscriber will, which is the at-least-once contract.
                    error!(session_id = %session_id, error = %e, "failed to mark messages delivered");
                }
                // No sleep here: keep draining while there is backlog.
            }
            Err(Error::Closed) => {
                debug!(session_id = %session_id, "store closed, subscriber exiting");
                break;
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "poll failed");
                consecutive_failures += 1;
                if let Some(limit) = poll_retry_limit {
                    if consecutive_failures >= limit {
                        error!(
                            session_id = %session_id,
                            failures = consecutive_failures,
                            "poll retry budget exhausted, subscriber stopping"
                        );
                        break;
                    }
                }
                tokio::time::sleep(polling_interval).await;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!(session_id = %session_id, "subscriber poll loop stopped");
}

/// Hands one row to every registered callback, isolating panics.
fn dispatch_row(session_id: &SessionId, callbacks: &CallbackList, row: &Message) {
    let guard = callbacks.read().expect("callback registry poisoned");
    for callback in guard.iter() {
        let event = MessageEvent::from(row);
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            error!(
                session_id = %session_id,
                id = row.id.as_raw(),
                "subscriber callback panicked"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
