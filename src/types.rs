//! # Domain Types for Spool
//!
//! This module defines the core types used throughout the engine: sessions,
//! message ids, and the three shapes a message takes on its way through the
//! pipeline.
//!
//! ## The Three Message Shapes
//!
//! ```text
//! publisher                      store                       subscriber
//!    │                             │                             │
//!    ▼                             ▼                             ▼
//! NewMessage ──── insert ────► Message ──── dispatch ────► MessageEvent
//! (no id yet)               (id assigned,              (id, event_type,
//!                            delivery state)            data only)
//! ```
//!
//! - [`NewMessage`] is the input form: what a publisher hands to the writer.
//!   It has no id; the store assigns one at insert.
//! - [`Message`] is the stored form read back from the database, including
//!   the id and delivery state.
//! - [`MessageEvent`] is the slim record handed to subscriber callbacks. The
//!   payload is passed through verbatim; the engine never re-encodes it.
//!
//! ## Newtypes
//!
//! [`MessageId`] and [`SessionId`] wrap primitives so a message id can never
//! be passed where a session is expected. `MessageId` additionally encodes
//! the cursor convention: id zero is the "nothing delivered yet" sentinel,
//! real ids start at 1 (SQLite rowids are 1-based).

use std::fmt;

use serde::Serialize;

// =============================================================================
// Message Identity
// =============================================================================

/// A database-assigned message id.
///
/// Ids are strictly increasing across all sessions and are never reused,
/// even after old rows are swept. They are the ordering authority: within a
/// session, delivery order is id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MessageId(i64);

impl MessageId {
    /// The cursor sentinel meaning "no message seen yet".
    ///
    /// A subscriber starting from `NONE` receives the entire undelivered
    /// backlog for its session. Real ids are always greater than zero.
    pub const NONE: MessageId = MessageId(0);

    /// Creates a MessageId from a raw database value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw i64 value for database binding.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// Returns true if this is the "no message seen yet" sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Session Identification
// =============================================================================

/// An opaque identifier for one logical event stream between a client and
/// the host.
///
/// Sessions are the unit of routing: every message belongs to exactly one
/// session, and a subscriber tails exactly one session. The engine does not
/// interpret the value; hosts typically use a UUID. Keep it at or under 36
/// characters to match the storage column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new session id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this session id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A message to be persisted: the input form handed to the writer.
///
/// No id yet; the store assigns one at insert. The payload is an opaque
/// string. Publishers with structured payloads use [`NewMessage::with_json`]
/// to encode them before enqueue; the engine itself never parses `data`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// The session this message is routed to.
    pub session_id: SessionId,

    /// Short label carried end-to-end (at the HTTP boundary it becomes the
    /// SSE `event:` field). At most 50 characters by convention; not
    /// interpreted by the engine.
    pub event_type: String,

    /// The payload. May be empty.
    pub data: String,

    /// When the message was accepted, in UTC unix milliseconds.
    pub created_ms: u64,
}

impl NewMessage {
    /// Creates a new message with a string payload, stamped with the current
    /// time.
    pub fn new(
        session_id: impl Into<SessionId>,
        event_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            event_type: event_type.into(),
            data: data.into(),
            created_ms: current_time_ms(),
        }
    }

    /// Creates a message by JSON-encoding a structured payload.
    ///
    /// The stored column stays an opaque string; this is a convenience for
    /// publishers, not a storage format.
    pub fn with_json<T: Serialize>(
        session_id: impl Into<SessionId>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_string(payload)?;
        Ok(Self::new(session_id, event_type, data))
    }
}

/// A stored message read back from the database.
#[derive(Debug, Clone)]
pub struct Message {
    /// Database-assigned id, the ordering authority.
    pub id: MessageId,

    /// The session this message belongs to.
    pub session_id: SessionId,

    /// Event type label, as supplied at publish time.
    pub event_type: String,

    /// The payload, verbatim from insertion.
    pub data: String,

    /// When the message was accepted (UTC unix milliseconds).
    pub created_ms: u64,

    /// When a subscriber finished handing this row to its callbacks.
    /// `None` means undelivered. Set at most once, never cleared.
    pub delivered_ms: Option<u64>,
}

impl Message {
    /// Returns true if this message has been delivered.
    pub fn is_delivered(&self) -> bool {
        self.delivered_ms.is_some()
    }
}

/// The record handed to subscriber callbacks.
///
/// Deliberately slim: id for resumability, event type for routing, payload
/// verbatim. Timestamps and the session id are not included since a callback
/// is registered per session and already knows it.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// The message id; clients echo it back as `Last-Event-ID` to resume.
    pub id: MessageId,

    /// Event type label.
    pub event_type: String,

    /// The payload, verbatim.
    pub data: String,
}

impl From<&Message> for MessageEvent {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            event_type: msg.event_type.clone(),
            data: msg.data.clone(),
        }
    }
}

// =============================================================================
// Time
// =============================================================================

/// Returns the current UTC time in unix milliseconds.
///
/// All timestamps in the engine (creation, delivery, retention cutoffs) use
/// this representation: an integer column compares and indexes cheaply.
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
