//! # Spool - Durable Session Pub/Sub over SQLite
//!
//! Spool is a durable, session-routed pub/sub transport built on SQLite. It
//! carries server-sent-event style streams between publishers (application
//! code producing events for a session) and subscribers (connections tailing
//! events for that session), with at-least-once delivery, in-order delivery
//! per session, and resumability by last event id after a disconnect.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Spool (facade)                           │
//! │            broadcast / subscribe / backlog / flush              │
//! └──────────┬──────────────────────────────────────┬───────────────┘
//!            │                                      │
//!            ▼                                      ▼
//! ┌─────────────────────────┐          ┌─────────────────────────────┐
//! │       Writer            │          │    Subscribers              │
//! │ (one worker, owns the   │          │ (one poll task per session, │
//! │  write connection,      │          │  dispatch to callbacks,     │
//! │  batched inserts)       │          │  mark delivered)            │
//! └──────────┬──────────────┘          └──────────┬──────────────────┘
//!            │                                    │
//!            ▼                                    ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     SQLite (messages table)                     │
//! │                  retention enforced by Sweeper                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single writer**: one worker performs every insert, so per-session id
//!    order equals publish order.
//! 2. **Monotonic ids**: message ids strictly increase and are never reused,
//!    even across retention deletes.
//! 3. **Delivery marks are final**: `delivered_ms` is set at most once and
//!    never cleared.
//! 4. **Monotonic cursors**: within one subscriber lifetime, no callback
//!    sees the same id twice.
//! 5. **Bounded intake**: publishers are never blocked; when the queue is
//!    full they observe a counted, logged drop.

/// Error types for Spool operations.
pub mod error;

/// Configuration with the engine's tuning knobs and defaults.
pub mod config;

/// Domain types: sessions, message ids, and message shapes.
pub mod types;

/// SQLite schema definition and database initialization.
pub mod schema;

/// Persistence operations and the pooled store handle.
pub mod store;

/// Batched message writer with bounded non-blocking intake.
pub mod writer;

/// Per-session polling subscriber.
pub mod subscriber;

/// Retention sweeper for delivered and stale undelivered messages.
pub mod sweeper;

/// The pub/sub facade and engine lifecycle.
pub mod api;

pub use api::Spool;
pub use config::Config;
pub use error::{Error, Result};
pub use schema::Database;
pub use store::Store;
pub use subscriber::{MessageCallback, Subscriber};
pub use sweeper::{SweepReport, Sweeper};
pub use writer::{spawn_writer, WriterHandle};

pub use types::{current_time_ms, Message, MessageEvent, MessageId, NewMessage, SessionId};
