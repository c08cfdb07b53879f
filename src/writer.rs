//! # Batched Message Writer
//!
//! This module implements the intake side of the engine: a bounded in-memory
//! queue that absorbs bursty concurrent publishes without blocking callers,
//! and a single worker that coalesces queued messages into multi-row inserts.
//!
//! ## Why Batch?
//!
//! SQLite commit cost is dominated by the fsync at the end of each
//! transaction. Inserting publishes one by one pays that cost per message;
//! gathering them pays it per batch:
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ msg1 → INSERT → fsync    │     │ INSERT (msg1..msg200)    │
//! │ msg2 → INSERT → fsync    │     │ 1 fsync                  │
//! │ ...                      │     └──────────────────────────┘
//! │ 200 fsyncs               │
//! └──────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! There is exactly one writer worker per engine, and it owns the write
//! connection. Messages enter the queue in the order `enqueue` accepts them
//! and leave it in the same order, so per-session insert order equals
//! publish order with no further coordination.
//!
//! ## Flush Sentinels
//!
//! `flush` pushes a sentinel through the same queue as the messages. When
//! the worker observes the sentinel it first writes everything gathered
//! before it, then signals the waiter, which gives `flush` its barrier
//! property: everything enqueued strictly before the call is persisted when
//! it returns.
//!
//! ## Lifecycle
//!
//! ```text
//! Running ── shutdown() ──► Draining ── queue empty ──► Stopped
//! ```
//!
//! In Draining the worker keeps pulling and inserting until the queue is
//! empty; new enqueues fail fast with `false`. If the drain exceeds the
//! shutdown timeout, the remaining messages are abandoned and their count is
//! logged.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store;
use crate::types::NewMessage;

// =============================================================================
// Configuration
// =============================================================================

/// Wait used when the batch is empty and there is nothing to time out for.
const IDLE_WAIT: Duration = Duration::from_secs(3_600);

/// Bounded wait for the worker's readiness signal during construction.
///
/// Purely a startup nicety: without it, a harness that constructs the writer
/// and immediately measures queue behavior can observe the brief window
/// before the worker begins receiving.
const READY_WAIT: Duration = Duration::from_millis(100);

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the writer worker.
enum WriterRequest {
    /// A message to persist.
    Publish(NewMessage),

    /// Flush sentinel: signalled once everything queued before it has been
    /// handed to the store.
    Flush(oneshot::Sender<()>),

    /// Drain the queue and exit; acknowledged when the drain completes.
    Shutdown(oneshot::Sender<()>),
}

// =============================================================================
// Writer Handle
// =============================================================================

/// Async handle to the writer worker.
///
/// `WriterHandle` is `Clone`; all clones feed the same queue and worker.
/// There is one worker per engine, which is what makes insert order equal
/// accept order.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterRequest>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    flush_timeout: Duration,
    shutdown_timeout: Duration,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WriterHandle {
    /// Enqueues a message for writing. Never blocks.
    ///
    /// Returns `true` if the message was accepted. Returns `false` when the
    /// intake queue is at capacity or the writer is shutting down; in either
    /// case the dropped counter is incremented and a warning names the
    /// session. Callers that need delivery must check this.
    pub fn enqueue(&self, message: NewMessage) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            warn!(session_id = %message.session_id, "writer is draining, dropping message");
            return false;
        }

        match self.tx.try_send(WriterRequest::Publish(message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                if let WriterRequest::Publish(msg) = request {
                    warn!(session_id = %msg.session_id, "intake queue full, dropping message");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                if let WriterRequest::Publish(msg) = request {
                    warn!(session_id = %msg.session_id, "writer has shut down, dropping message");
                }
                false
            }
        }
    }

    /// Enqueues a message, waiting for queue capacity if necessary.
    ///
    /// The opt-in alternative to [`enqueue`](Self::enqueue) for publishers
    /// that prefer suspension over drops.
    pub async fn enqueue_wait(&self, message: NewMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        self.tx
            .send(WriterRequest::Publish(message))
            .await
            .map_err(|_| Error::Closed)
    }

    /// Blocks until every message enqueued strictly before this call has
    /// been handed to the store, or the flush deadline elapses.
    ///
    /// On deadline a warning is logged and the call returns `Ok`; the
    /// messages are still queued and will be written when the worker catches
    /// up.
    pub async fn flush(&self) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(WriterRequest::Flush(response_tx))
            .await
            .map_err(|_| Error::Closed)?;

        match timeout(self.flush_timeout, response_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                warn!(
                    deadline_ms = self.flush_timeout.as_millis() as u64,
                    "flush deadline elapsed before the writer caught up"
                );
                Ok(())
            }
        }
    }

    /// Shuts the writer down gracefully.
    ///
    /// Marks the intake closed (subsequent enqueues fail fast), waits up to
    /// the shutdown timeout for the worker to drain the queue into the
    /// store, then joins the worker thread. On timeout the residue is
    /// abandoned with the pending count logged.
    pub async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterRequest::Shutdown(done_tx)).await.is_err() {
            // Worker already gone; nothing left to drain.
            self.join_worker().await;
            return Ok(());
        }

        match timeout(self.shutdown_timeout, done_rx).await {
            Ok(_) => {
                self.join_worker().await;
                info!("writer shutdown complete");
            }
            Err(_) => {
                // Approximate: everything still occupying queue slots, less
                // the shutdown request itself.
                let pending = (self.tx.max_capacity() - self.tx.capacity()).saturating_sub(1);
                warn!(
                    pending,
                    "writer shutdown timed out, abandoning queued messages"
                );
            }
        }

        Ok(())
    }

    /// Number of messages rejected by [`enqueue`](Self::enqueue) since the
    /// writer started.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    async fn join_worker(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Spawns the writer worker on a dedicated thread.
///
/// The thread owns the write connection for its whole lifetime and runs a
/// current-thread runtime so it can receive from the async channel.
/// Construction waits a short bounded time for the worker's readiness
/// signal before returning.
pub fn spawn_writer(conn: Connection, config: &Config) -> Result<WriterHandle> {
    let (tx, rx) = mpsc::channel(config.max_queue_size);
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

    let batch_size = config.batch_size;
    let flush_interval = config.flush_interval;

    let handle = thread::Builder::new()
        .name("spool-writer".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create writer runtime");

            rt.block_on(run_writer(conn, rx, batch_size, flush_interval, ready_tx));
            debug!("writer worker exited");
        })
        .map_err(|e| Error::Worker(format!("failed to spawn writer thread: {e}")))?;

    let _ = ready_rx.recv_timeout(READY_WAIT);

    info!(
        batch_size,
        queue_size = config.max_queue_size,
        "writer started"
    );

    Ok(WriterHandle {
        tx,
        closed: Arc::new(AtomicBool::new(false)),
        dropped: Arc::new(AtomicU64::new(0)),
        flush_timeout: config.flush_timeout,
        shutdown_timeout: config.shutdown_timeout,
        handle: Arc::new(Mutex::new(Some(handle))),
    })
}

/// The writer loop: gather, insert, signal.
///
/// Waits indefinitely while idle. Once a batch is open, further receives are
/// bounded by the remaining flush-interval window, and each received message
/// triggers an opportunistic non-blocking soak of whatever else is already
/// queued. A batch is written when it reaches `batch_size`, when a flush
/// sentinel arrives, or when the window elapses.
async fn run_writer(
    conn: Connection,
    mut rx: mpsc::Receiver<WriterRequest>,
    batch_size: usize,
    flush_interval: Duration,
    ready: std::sync::mpsc::SyncSender<()>,
) {
    let _ = ready.send(());

    let mut batch: Vec<NewMessage> = Vec::with_capacity(batch_size);
    let mut flush_waiters: Vec<oneshot::Sender<()>> = Vec::new();
    let mut batch_start: Option<Instant> = None;

    loop {
        let wait = if batch.is_empty() {
            IDLE_WAIT
        } else {
            let elapsed = batch_start.map(|s| s.elapsed()).unwrap_or_default();
            flush_interval.saturating_sub(elapsed)
        };

        match timeout(wait, rx.recv()).await {
            Ok(Some(WriterRequest::Publish(msg))) => {
                if batch.is_empty() {
                    batch_start = Some(Instant::now());
                }
                batch.push(msg);

                // Soak up whatever is already queued without blocking.
                let mut flush_pending = false;
                while batch.len() < batch_size {
                    match rx.try_recv() {
                        Ok(WriterRequest::Publish(msg)) => batch.push(msg),
                        Ok(WriterRequest::Flush(waiter)) => {
                            flush_waiters.push(waiter);
                            flush_pending = true;
                            break;
                        }
                        Ok(WriterRequest::Shutdown(done)) => {
                            finish_draining(&conn, &mut rx, batch, flush_waiters, done, batch_size);
                            return;
                        }
                        Err(_) => break,
                    }
                }

                if batch.len() >= batch_size || flush_pending {
                    write_batch(&conn, &mut batch, batch_size);
                    signal_flush_waiters(&mut flush_waiters);
                    batch_start = None;
                }
            }
            Ok(Some(WriterRequest::Flush(waiter))) => {
                flush_waiters.push(waiter);
                write_batch(&conn, &mut batch, batch_size);
                signal_flush_waiters(&mut flush_waiters);
                batch_start = None;
            }
            Ok(Some(WriterRequest::Shutdown(done))) => {
                finish_draining(&conn, &mut rx, batch, flush_waiters, done, batch_size);
                return;
            }
            Ok(None) => {
                // All handles dropped; treat like a shutdown with nothing to
                // acknowledge.
                write_batch(&conn, &mut batch, batch_size);
                signal_flush_waiters(&mut flush_waiters);
                debug!("writer channel closed, exiting");
                return;
            }
            Err(_) => {
                // Batch window elapsed.
                write_batch(&conn, &mut batch, batch_size);
                signal_flush_waiters(&mut flush_waiters);
                batch_start = None;
            }
        }
    }
}

/// Drains everything left in the queue, writes it, and acknowledges every
/// outstanding shutdown request.
fn finish_draining(
    conn: &Connection,
    rx: &mut mpsc::Receiver<WriterRequest>,
    mut batch: Vec<NewMessage>,
    mut flush_waiters: Vec<oneshot::Sender<()>>,
    done: oneshot::Sender<()>,
    batch_size: usize,
) {
    let mut acks = vec![done];

    while let Ok(request) = rx.try_recv() {
        match request {
            WriterRequest::Publish(msg) => batch.push(msg),
            WriterRequest::Flush(waiter) => flush_waiters.push(waiter),
            WriterRequest::Shutdown(ack) => acks.push(ack),
        }
    }

    let drained = batch.len();
    write_batch(conn, &mut batch, batch_size);
    signal_flush_waiters(&mut flush_waiters);

    for ack in acks {
        let _ = ack.send(());
    }

    debug!(drained, "writer drained on shutdown");
}

/// Writes the gathered batch in `batch_size` chunks and clears it.
///
/// Chunking keeps each statement under SQLite's bound-parameter limit even
/// when a shutdown drain hands over far more than one batch worth of
/// messages. A failed chunk is logged and discarded; the worker does not
/// exit on insert errors, it continues with the next chunk. An unavailable
/// store therefore shows up as dropped counts and warnings rather than
/// unbounded memory growth.
fn write_batch(conn: &Connection, batch: &mut Vec<NewMessage>, batch_size: usize) {
    if batch.is_empty() {
        return;
    }

    for chunk in batch.chunks(batch_size.max(1)) {
        match store::insert_batch(conn, chunk) {
            Ok(count) => debug!(count, "wrote message batch"),
            Err(e) => {
                error!(error = %e, count = chunk.len(), "failed to write batch, messages lost");
            }
        }
    }

    batch.clear();
}

/// Signals every pending flush sentinel.
fn signal_flush_waiters(waiters: &mut Vec<oneshot::Sender<()>>) {
    for waiter in waiters.drain(..) {
        let _ = waiter.send(());
    }
}

// =============================================================================
// Tests
// =============================================================================
