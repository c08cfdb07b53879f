//! # Message Store
//!
//! All persistence goes through this module. It has two layers:
//!
//! 1. **Direct SQL functions** operating on a `&Connection`
//!    ([`insert_batch`], [`fetch_undelivered`], [`mark_delivered`],
//!    [`delete_old_delivered`], [`delete_old_undelivered`],
//!    [`sweep_expired`]). The writer calls these on the connection it owns.
//! 2. **A pooled async handle** ([`Store`]) for every other component.
//!    Subscribers, the backlog read path, and the sweeper talk to a small
//!    pool of dedicated threads, each owning its own SQLite connection,
//!    competing on a shared request channel.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Async Tasks                            │
//! │   subscriber polls    backlog reads    sweeper runs           │
//! └───────────────┬──────────────────────────────────────────────┘
//!                 │ mpsc (StoreRequest + oneshot response)
//!                 ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Store Pool                              │
//! │   ┌─────────┐  ┌─────────┐  ┌─────────┐                      │
//! │   │thread 0 │  │thread 1 │  │thread N │   own connections    │
//! │   └────┬────┘  └────┬────┘  └────┬────┘                      │
//! │        └────────────┴────────────┘                            │
//! └────────────────────────────┬─────────────────────────────────┘
//!                              ▼
//!                         SQLite (WAL)
//! ```
//!
//! SQLite connections are not `Sync`, so they cannot be shared across async
//! tasks directly. Owning each connection on a dedicated thread and bridging
//! with channels keeps callers non-blocking, and each request is a scoped
//! use of one pooled connection: a slow subscriber cannot pin a connection
//! between polls.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, available_parallelism, JoinHandle};

use rusqlite::types::ToSqlOutput;
use rusqlite::{params, Connection, ToSql};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::Database;
use crate::types::{current_time_ms, Message, MessageId, NewMessage, SessionId};

// =============================================================================
// Configuration
// =============================================================================

/// Size of the store request channel.
const STORE_CHANNEL_SIZE: usize = 1024;

/// Minimum number of pool threads.
const MIN_POOL_THREADS: usize = 1;

/// Maximum number of pool threads.
///
/// Store traffic is light (periodic polls, occasional backlog reads), so a
/// small pool is enough; more threads would only contend on SQLite's write
/// lock when marking rows delivered.
const MAX_POOL_THREADS: usize = 4;

/// Returns the default pool size for this machine.
pub fn suggested_pool_size() -> usize {
    available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_POOL_THREADS)
        .clamp(MIN_POOL_THREADS, MAX_POOL_THREADS)
}

// =============================================================================
// SQL Bindings for Newtypes
// =============================================================================

impl ToSql for SessionId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl ToSql for MessageId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_raw()))
    }
}

// =============================================================================
// Direct SQL Operations
// =============================================================================

/// Atomically inserts a batch of messages.
///
/// A single multi-row INSERT: SQLite executes it in one implicit
/// transaction, so the batch either lands in full or not at all. Ids are
/// assigned by the database and not returned; readers pick them up on the
/// next poll.
pub fn insert_batch(conn: &Connection, rows: &[NewMessage]) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut sql = String::from(
        "INSERT INTO messages (session_id, event_type, data, created_ms) VALUES ",
    );
    for i in 0..rows.len() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str("(?, ?, ?, ?)");
    }

    let created: Vec<i64> = rows.iter().map(|r| r.created_ms as i64).collect();
    let mut values: Vec<&dyn ToSql> = Vec::with_capacity(rows.len() * 4);
    for (row, created_ms) in rows.iter().zip(created.iter()) {
        values.push(&row.session_id);
        values.push(&row.event_type);
        values.push(&row.data);
        values.push(created_ms);
    }

    let inserted = conn.execute(&sql, &values[..])?;
    Ok(inserted)
}

/// Fetches up to `limit` undelivered messages for a session with ids greater
/// than `after`, in ascending id order.
///
/// This is the subscriber poll and the reconnection backlog query; it walks
/// the `(session_id, id)` index in order.
pub fn fetch_undelivered(
    conn: &Connection,
    session_id: &SessionId,
    after: MessageId,
    limit: usize,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, event_type, data, created_ms, delivered_ms
         FROM messages
         WHERE session_id = ? AND delivered_ms IS NULL AND id > ?
         ORDER BY id
         LIMIT ?",
    )?;

    let rows = stmt.query_map(params![session_id, after, limit as i64], |row| {
        Ok(Message {
            id: MessageId::from_raw(row.get(0)?),
            session_id: SessionId::new(row.get::<_, String>(1)?),
            event_type: row.get(2)?,
            data: row.get(3)?,
            created_ms: row.get::<_, i64>(4)? as u64,
            delivered_ms: row.get::<_, Option<i64>>(5)?.map(|ms| ms as u64),
        })
    })?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Marks the given messages delivered at `now_ms`.
///
/// Idempotent, and only rows still undelivered are touched: a delivery
/// timestamp is written at most once and never moved, so overlapping
/// re-deliveries across subscriber lifetimes keep the original timestamp.
pub fn mark_delivered(conn: &Connection, ids: &[MessageId], now_ms: u64) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "UPDATE messages SET delivered_ms = ? WHERE id IN ({placeholders}) AND delivered_ms IS NULL"
    );

    let now = now_ms as i64;
    let mut values: Vec<&dyn ToSql> = Vec::with_capacity(ids.len() + 1);
    values.push(&now);
    for id in ids {
        values.push(id);
    }

    let updated = conn.execute(&sql, &values[..])?;
    Ok(updated)
}

/// Deletes delivered messages whose delivery timestamp is older than
/// `cutoff_ms`. Returns the number of rows removed.
pub fn delete_old_delivered(conn: &Connection, cutoff_ms: u64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM messages WHERE delivered_ms IS NOT NULL AND delivered_ms < ?",
        params![cutoff_ms as i64],
    )?;
    Ok(deleted)
}

/// Deletes undelivered messages created before `cutoff_ms`. Returns the
/// number of rows removed.
pub fn delete_old_undelivered(conn: &Connection, cutoff_ms: u64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM messages WHERE delivered_ms IS NULL AND created_ms < ?",
        params![cutoff_ms as i64],
    )?;
    Ok(deleted)
}

/// Runs both retention deletes inside a single transaction.
///
/// Returns `(delivered_removed, undelivered_removed)`. Uses raw transaction
/// statements so the function can work with a shared `&Connection`.
pub fn sweep_expired(
    conn: &Connection,
    delivered_cutoff_ms: u64,
    undelivered_cutoff_ms: u64,
) -> Result<(usize, usize)> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let outcome = (|| {
        let delivered = delete_old_delivered(conn, delivered_cutoff_ms)?;
        let undelivered = delete_old_undelivered(conn, undelivered_cutoff_ms)?;
        Ok((delivered, undelivered))
    })();

    match outcome {
        Ok(counts) => {
            conn.execute_batch("COMMIT")?;
            Ok(counts)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the store pool.
enum StoreRequest {
    FetchUndelivered {
        session_id: SessionId,
        after: MessageId,
        limit: usize,
        response: oneshot::Sender<Result<Vec<Message>>>,
    },
    MarkDelivered {
        ids: Vec<MessageId>,
        now_ms: u64,
        response: oneshot::Sender<Result<usize>>,
    },
    Sweep {
        delivered_cutoff_ms: u64,
        undelivered_cutoff_ms: u64,
        response: oneshot::Sender<Result<(usize, usize)>>,
    },
    Shutdown,
}

// =============================================================================
// Store Handle
// =============================================================================

/// Async handle to the store pool.
///
/// `Store` is `Clone`; all clones share the same pool. Every method sends a
/// request over the channel and awaits a oneshot response, so callers never
/// block on SQLite directly.
#[derive(Clone)]
pub struct Store {
    tx: mpsc::Sender<StoreRequest>,
    pool_size: usize,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Store {
    /// Fetches up to `limit` undelivered messages for a session after the
    /// given cursor, in ascending id order.
    pub async fn fetch_undelivered(
        &self,
        session_id: &SessionId,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(StoreRequest::FetchUndelivered {
                session_id: session_id.clone(),
                after,
                limit,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Closed)?;

        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Marks the given messages delivered now. Idempotent.
    pub async fn mark_delivered(&self, ids: Vec<MessageId>) -> Result<usize> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(StoreRequest::MarkDelivered {
                ids,
                now_ms: current_time_ms(),
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Closed)?;

        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Runs both retention deletes in one transaction. Returns
    /// `(delivered_removed, undelivered_removed)`.
    pub async fn sweep(
        &self,
        delivered_cutoff_ms: u64,
        undelivered_cutoff_ms: u64,
    ) -> Result<(usize, usize)> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(StoreRequest::Sweep {
                delivered_cutoff_ms,
                undelivered_cutoff_ms,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Closed)?;

        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Returns the number of pool threads.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Shuts the pool down and waits for its threads.
    ///
    /// Each thread exits after consuming one shutdown request (or when the
    /// channel closes). Safe to call more than once.
    pub async fn shutdown(&self) {
        for _ in 0..self.pool_size {
            let _ = self.tx.send(StoreRequest::Shutdown).await;
        }

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Spawns the store pool against a database file.
///
/// Each thread opens its own connection (schema initialization is
/// idempotent) and runs a current-thread runtime servicing the shared
/// request channel. Threads compete for requests, which load-balances
/// without any routing logic.
pub fn spawn_store(path: impl AsRef<Path>, pool_size: usize) -> Result<Store> {
    let (tx, rx) = mpsc::channel(STORE_CHANNEL_SIZE);
    let rx = Arc::new(std::sync::Mutex::new(rx));
    let path = path.as_ref().to_path_buf();

    let mut handles = Vec::with_capacity(pool_size);

    for i in 0..pool_size {
        let rx = Arc::clone(&rx);
        let path = path.clone();

        let handle = thread::Builder::new()
            .name(format!("spool-store-{i}"))
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to create store runtime");

                rt.block_on(async {
                    let conn = match Database::open(&path) {
                        Ok(db) => db.into_connection(),
                        Err(e) => {
                            tracing::error!(error = %e, "store thread failed to open database");
                            return;
                        }
                    };
                    run_store_pooled(conn, rx).await;
                });
            })
            .map_err(|e| Error::Worker(format!("failed to spawn store thread: {e}")))?;

        handles.push(handle);
    }

    debug!(pool_size, "store pool started");

    Ok(Store {
        tx,
        pool_size,
        handles: Arc::new(Mutex::new(handles)),
    })
}

/// Pooled store loop.
///
/// Threads compete to lock the receiver and take the next request; whichever
/// thread is free picks it up.
async fn run_store_pooled(
    conn: Connection,
    rx: Arc<std::sync::Mutex<mpsc::Receiver<StoreRequest>>>,
) {
    loop {
        let request = {
            let mut guard = rx.lock().expect("store receiver mutex poisoned");
            guard.recv().await
        };

        match request {
            Some(StoreRequest::FetchUndelivered {
                session_id,
                after,
                limit,
                response,
            }) => {
                let result = fetch_undelivered(&conn, &session_id, after, limit);
                let _ = response.send(result);
            }
            Some(StoreRequest::MarkDelivered {
                ids,
                now_ms,
                response,
            }) => {
                let result = mark_delivered(&conn, &ids, now_ms);
                let _ = response.send(result);
            }
            Some(StoreRequest::Sweep {
                delivered_cutoff_ms,
                undelivered_cutoff_ms,
                response,
            }) => {
                let result = sweep_expired(&conn, delivered_cutoff_ms, undelivered_cutoff_ms);
                let _ = response.send(result);
            }
            Some(StoreRequest::Shutdown) | None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
