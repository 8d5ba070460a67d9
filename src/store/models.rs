//! Row payloads for record store writes.

use chrono::{DateTime, Utc};

/// A top-level message ready for insertion.
#[derive(Debug, Clone)]
pub struct NewMainMessage {
    /// Source-assigned identifier, the natural dedup key
    pub external_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub reply_count: i32,
}

/// A reply message ready for insertion. `main_message_id` is the parent's
/// store-assigned identifier and must already exist.
#[derive(Debug, Clone)]
pub struct NewReplyMessage {
    pub external_id: String,
    pub main_message_id: i64,
    pub channel_id: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of an idempotent main-message insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainInsert {
    /// Row created; carries the store-assigned identifier needed to link
    /// replies.
    Inserted(i64),
    /// A row with this external identifier already existed; no identifier
    /// is returned and no reply fan-out should happen.
    Duplicate,
}
