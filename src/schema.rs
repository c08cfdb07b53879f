//! # SQLite Schema for Spool
//!
//! One table, two indexes. The `messages` table is the entire persisted
//! state of the engine: rows are created by the writer, marked delivered by
//! subscribers, and eventually removed by the sweeper.
//!
//! ## Index Design
//!
//! The two indexes cover the two hot read paths:
//!
//! - `(session_id, id)`: a subscriber poll is
//!   `WHERE session_id = ? AND id > ? ORDER BY id`, which walks this index
//!   in order with no sort step.
//! - `(delivered_ms, created_ms)`: the sweeper's cutoff scans
//!   (`delivered_ms < ?`, or `delivered_ms IS NULL AND created_ms < ?`)
//!   range-scan this index instead of the table.
//!
//! ## Why AUTOINCREMENT?
//!
//! Message ids are the ordering authority and double as client resume
//! cursors, so they must be strictly increasing and never reused. Plain
//! rowids can be recycled after deletes; `AUTOINCREMENT` forbids reuse, which
//! matters here because the sweeper deletes old rows continuously.

use rusqlite::Connection;

use crate::error::Result;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `messages` table: the delivery log.
///
/// - `id`: monotonic, never-reused message id (see module docs)
/// - `session_id`: routing key, opaque to the engine (<= 36 chars)
/// - `event_type`: short label carried end-to-end (<= 50 chars)
/// - `data`: opaque payload string, may be empty
/// - `created_ms`: UTC unix milliseconds at enqueue
/// - `delivered_ms`: NULL until a subscriber has handed the row to all of
///   its callbacks; set at most once
const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id   TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    data         TEXT NOT NULL,
    created_ms   INTEGER NOT NULL,
    delivered_ms INTEGER
)
"#;

/// Index backing subscriber polls and the reconnection backlog query.
const CREATE_SESSION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS messages_session_id
ON messages(session_id, id)
"#;

/// Index backing the sweeper's retention scans.
const CREATE_DELIVERED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS messages_delivered
ON messages(delivered_ms, created_ms)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the Spool schema initialized.
///
/// `Database` owns its `Connection`; dropping it closes the connection.
/// Opening is idempotent (all DDL uses `IF NOT EXISTS`), so every component
/// that opens the same file converges on the same schema.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// `Error::Sqlite` if the file cannot be opened or the DDL fails.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database.
    ///
    /// In-memory databases are private to their connection, so this is only
    /// useful for exercising single-connection components in tests. The
    /// composed engine always runs against a file.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Initializes pragmas and schema. Called by both open paths.
    fn initialize(&mut self) -> Result<()> {
        // WAL mode: readers see a consistent snapshot while the writer
        // commits, which is what lets the subscriber pool and the writer
        // share one file without blocking each other.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;

        // Sync the WAL on commit but not on every write. Loses at most the
        // last transaction on an OS crash; acceptable for a delivery log
        // whose producers already tolerate drops under backpressure.
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        // Multiple connections write this file (writer inserts, subscribers
        // mark delivered, sweeper deletes). A busy timeout makes them queue
        // on SQLite's write lock instead of failing immediately.
        self.conn.execute_batch("PRAGMA busy_timeout = 5000")?;

        self.conn.execute_batch(CREATE_MESSAGES)?;
        self.conn.execute_batch(CREATE_SESSION_INDEX)?;
        self.conn.execute_batch(CREATE_DELIVERED_INDEX)?;

        Ok(())
    }

    /// Consumes the wrapper and returns the raw connection.
    ///
    /// Used to hand an initialized connection to a worker that owns it for
    /// its whole lifetime (the writer thread does this).
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Returns a reference to the underlying connection.
    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
