//! # Spool - the Pub/Sub Facade
//!
//! [`Spool`] is the handle the host application talks to. It composes the
//! writer (intake side), the store pool (read and delivery side), the
//! per-session subscribers, and the retention sweeper:
//!
//! ```text
//! publishers                                   subscribers (callbacks)
//!     │ broadcast                                      ▲
//!     ▼                                                │ dispatch
//! ┌──────────┐   batch    ┌─────────────┐   poll  ┌────┴────────┐
//! │  Writer  │──insert───►│   SQLite    │◄────────│ Subscriber  │
//! │ (1 thread│            │  messages   │  mark   │ (1 task per │
//! │  /engine)│            │   table     │◄────────│  session)   │
//! └──────────┘            └─────────────┘         └─────────────┘
//!                                ▲
//!                 Sweeper ───────┘ retention deletes
//! ```
//!
//! ## Ownership
//!
//! `Spool` is an explicitly constructed value owned by the host's top-level
//! application scope. There are no process globals; teardown is
//! `shutdown(self)`, which consumes the handle so nothing can use the engine
//! after it has stopped. Tie it to the host's shutdown hook.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spool::{Config, Spool};
//!
//! #[tokio::main]
//! async fn main() -> spool::Result<()> {
//!     let spool = Spool::open("messages.db", Config::default())?;
//!
//!     spool.subscribe("session-1", Box::new(|event| {
//!         println!("{}: {}", event.event_type, event.data);
//!     })).await;
//!
//!     spool.broadcast("session-1", "message", r#"{"hello":"world"}"#);
//!
//!     spool.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::schema::Database;
use crate::store::{self, Store};
use crate::subscriber::{CallbackList, MessageCallback, Subscriber};
use crate::sweeper::Sweeper;
use crate::types::{Message, MessageId, NewMessage, SessionId};
use crate::writer::{spawn_writer, WriterHandle};

// =============================================================================
// Session State
// =============================================================================

/// Everything the hub tracks per subscribed session.
struct SessionEntry {
    /// The registration list shared with the subscriber.
    callbacks: CallbackList,

    /// The delivery loop for this session.
    subscriber: Subscriber,
}

// =============================================================================
// Spool
// =============================================================================

/// The pub/sub engine.
///
/// Publishers call [`broadcast`](Self::broadcast) (non-blocking,
/// success-or-drop); consumers register callbacks with
/// [`subscribe`](Self::subscribe); reconnecting HTTP clients replay through
/// [`backlog`](Self::backlog).
pub struct Spool {
    store: Store,
    writer: WriterHandle,
    config: Config,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl Spool {
    /// Opens the engine against a database file, creating the schema if
    /// needed, and starts the writer worker and store pool.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref();

        let db = Database::open(path)?;
        let writer = spawn_writer(db.into_connection(), &config)?;
        let store = store::spawn_store(path, store::suggested_pool_size())?;

        info!(path = %path.display(), "spool engine initialized");

        Ok(Self {
            store,
            writer,
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    // =========================================================================
    // Publish Side
    // =========================================================================

    /// Broadcasts a message to a session. Never blocks.
    ///
    /// Returns `true` if the message was accepted into the intake queue,
    /// `false` if the queue was full or the engine is draining (the drop is
    /// counted and logged). Acceptance is not delivery: the publisher does
    /// not observe when subscribers see the message.
    pub fn broadcast(
        &self,
        session_id: impl Into<SessionId>,
        event_type: impl Into<String>,
        data: impl Into<String>,
    ) -> bool {
        self.writer
            .enqueue(NewMessage::new(session_id, event_type, data))
    }

    /// Broadcasts a structured payload, JSON-encoding it first.
    ///
    /// The stored payload is the encoded string; subscribers and the SSE
    /// boundary see it verbatim.
    pub fn broadcast_json<T: Serialize>(
        &self,
        session_id: impl Into<SessionId>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<bool> {
        let message = NewMessage::with_json(session_id, event_type, payload)?;
        Ok(self.writer.enqueue(message))
    }

    /// Broadcasts a message, waiting for intake capacity instead of
    /// dropping. The opt-in alternative for publishers that prefer
    /// suspension over loss.
    pub async fn broadcast_wait(
        &self,
        session_id: impl Into<SessionId>,
        event_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<()> {
        self.writer
            .enqueue_wait(NewMessage::new(session_id, event_type, data))
            .await
    }

    /// Blocks until everything broadcast strictly before this call has been
    /// persisted, or the flush deadline elapses.
    pub async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }

    /// Number of messages rejected by `broadcast` since the engine started.
    pub fn dropped_count(&self) -> u64 {
        self.writer.dropped_count()
    }

    // =========================================================================
    // Subscribe Side
    // =========================================================================

    /// Registers a callback for a session.
    ///
    /// The first registration for a session creates and starts its
    /// subscriber; later registrations share it and see the same stream.
    /// Get-or-create happens under the session-map lock, so two concurrent
    /// subscribes for the same session never start two subscribers.
    pub async fn subscribe(&self, session_id: impl Into<SessionId>, callback: MessageCallback) {
        let session_id = session_id.into();
        let mut sessions = self.sessions.lock().await;

        match sessions.entry(session_id.clone()) {
            Entry::Occupied(entry) => {
                entry
                    .get()
                    .callbacks
                    .write()
                    .expect("callback registry poisoned")
                    .push(callback);
            }
            Entry::Vacant(slot) => {
                let callbacks: CallbackList = Arc::new(RwLock::new(vec![callback]));
                let mut subscriber = Subscriber::new(
                    session_id,
                    self.store.clone(),
                    Arc::clone(&callbacks),
                    &self.config,
                );
                subscriber.start();
                slot.insert(SessionEntry {
                    callbacks,
                    subscriber,
                });
            }
        }
    }

    /// Removes all callbacks for a session and stops its subscriber.
    /// A no-op if the session has no subscription.
    pub async fn unsubscribe(&self, session_id: impl Into<SessionId>) {
        let session_id = session_id.into();
        let entry = self.sessions.lock().await.remove(&session_id);

        if let Some(mut entry) = entry {
            entry
                .callbacks
                .write()
                .expect("callback registry poisoned")
                .clear();
            entry.subscriber.stop().await;
            debug!(session_id = %session_id, "unsubscribed");
        }
    }

    /// Returns true if the session currently has a subscriber.
    pub async fn is_subscribed(&self, session_id: impl Into<SessionId>) -> bool {
        self.sessions.lock().await.contains_key(&session_id.into())
    }

    /// Number of sessions with an active subscription.
    pub async fn subscription_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    // =========================================================================
    // Read Side
    // =========================================================================

    /// Returns up to `limit` undelivered messages for a session with ids
    /// greater than `after`, in id order.
    ///
    /// This is the reconnection read path: a host HTTP handler maps a
    /// client's `Last-Event-ID` header to `after` and replays the rows as
    /// SSE frames. The rows stay undelivered; a live subscriber marks them
    /// in due course. Callers that replay through this path must tolerate
    /// seeing a row here and again from a subscriber.
    pub async fn backlog(
        &self,
        session_id: impl Into<SessionId>,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.store
            .fetch_undelivered(&session_id.into(), after, limit)
            .await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Builds the retention sweeper for this engine, for the host's job
    /// scheduler to run periodically.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.store.clone(), &self.config)
    }

    /// Shuts the engine down gracefully.
    ///
    /// Stops every subscriber, drains and stops the writer (bounded by the
    /// shutdown timeout), then stops the store pool. Consumes the handle;
    /// the engine cannot be used afterwards.
    pub async fn shutdown(self) -> Result<()> {
        info!("spool engine shutting down");

        let mut sessions = self.sessions.into_inner();
        for (session_id, mut entry) in sessions.drain() {
            debug!(session_id = %session_id, "stopping subscriber");
            entry
                .callbacks
                .write()
                .expect("callback registry poisoned")
                .clear();
            entry.subscriber.stop().await;
        }

        self.writer.shutdown().await?;
        self.store.shutdown().await;

        info!("spool engine shutdown complete");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            polling_interval: Duration::from_millis(10),
            flush_interval: Duration::from_millis(5),
            ..Config::default()
        }
    }

    fn create_spool(name: &str) -> (tempfile::TempDir, Spool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let spool = Spool::open(&path, test_config()).unwrap();
        (dir, spool)
    }

    async fn eventually(timeout: Duration, mut f: impl FnMut() -> bool) {
        let start = std::time::Instant::now();
        while !f() {
            if start.elapsed() > timeout {
                panic!("condition not met within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_open_and_shutdown() {
        let (_dir, spool) = create_spool("api_open.db");
        spool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_and_receive() {
        let (_dir, spool) = create_spool("api_basic.db");

        let received = Arc::new(AtomicUsize::new(0));
        let r = received.clone();
        spool
            .subscribe(
                "session-1",
                Box::new(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        for i in 0..5 {
            assert!(spool.broadcast("session-1", "message", format!(r#"{{"i":{i}}}"#)));
        }

        spool.flush().await.unwrap();
        eventually(Duration::from_secs(2), || {
            received.load(Ordering::SeqCst) == 5
        })
        .await;

        spool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_subscribe_shares_subscriber() {
        let (_dir, spool) = create_spool("api_shared.db");

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        spool
            .subscribe(
                "session-1",
                Box::new(move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        let s = second.clone();
        spool
            .subscribe(
                "session-1",
                Box::new(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        // Still one session entry, one subscriber.
        assert_eq!(spool.subscription_count().await, 1);

        spool.broadcast("session-1", "message", "{}");
        spool.flush().await.unwrap();

        eventually(Duration::from_secs(2), || {
            first.load(Ordering::SeqCst) == 1 && second.load(Ordering::SeqCst) == 1
        })
        .await;

        spool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (_dir, spool) = create_spool("api_unsubscribe.db");

        spool.subscribe("session-1", Box::new(|_| {})).await;
        assert!(spool.is_subscribed("session-1").await);
        assert_eq!(spool.subscription_count().await, 1);

        spool.unsubscribe("session-1").await;
        assert!(!spool.is_subscribed("session-1").await);
        assert_eq!(spool.subscription_count().await, 0);

        // Unsubscribing again is a no-op.
        spool.unsubscribe("session-1").await;

        spool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_json() {
        let (_dir, spool) = create_spool("api_json.db");

        #[derive(Serialize)]
        struct Payload {
            n: u32,
        }

        assert!(spool
            .broadcast_json("session-1", "message", &Payload { n: 1 })
            .unwrap());
        spool.flush().await.unwrap();

        let rows = spool
            .backlog("session-1", MessageId::NONE, 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, r#"{"n":1}"#);

        spool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_backlog_does_not_mark_delivered() {
        let (_dir, spool) = create_spool("api_backlog.db");

        spool.broadcast("session-1", "message", "one");
        spool.broadcast("session-1", "message", "two");
        spool.flush().await.unwrap();

        let first = spool
            .backlog("session-1", MessageId::NONE, 100)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        // A second read sees the same rows: backlog is a replay, not a
        // durable subscription.
        let again = spool
            .backlog("session-1", MessageId::NONE, 100)
            .await
            .unwrap();
        assert_eq!(again.len(), 2);

        // Resuming after the first id returns only the second.
        let tail = spool.backlog("session-1", first[0].id, 100).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].data, "two");

        spool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_wait() {
        let (_dir, spool) = create_spool("api_wait.db");

        spool
            .broadcast_wait("session-1", "message", "{}")
            .await
            .unwrap();
        spool.flush().await.unwrap();

        let rows = spool
            .backlog("session-1", MessageId::NONE, 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        spool.shutdown().await.unwrap();
    }
}
