//! Queue item wire format.
//!
//! A [`QueueItem`] is the only payload that crosses the queue fabric. It is
//! a closed tagged union with one case per documented item kind, serialized
//! as JSON with a `"type"` discriminator. Unknown fields are ignored on decode
//! and optional fields default, so older and newer payload shapes remain
//! mutually decodable.

use serde::{Deserialize, Serialize};

use crate::history::{MessagePayload, UserProfile};

pub const USER_QUEUE: &str = "user_queue";
pub const CHANNEL_QUEUE: &str = "channel_queue";
pub const MESSAGE_QUEUE: &str = "message_queue";

/// All queues the pipeline declares at startup.
pub const INGEST_QUEUES: [&str; 3] = [USER_QUEUE, CHANNEL_QUEUE, MESSAGE_QUEUE];

/// A unit of work published onto one of the three queues.
///
/// Each variant carries enough context for its consumer to act without
/// further lookups; only the main-message path does a secondary fetch (the
/// reply fan-out). Items exist only between publish and acknowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueItem {
    /// A user profile to upsert
    User { user: UserProfile },

    /// A discovered channel to insert if absent
    Channel {
        channel_id: String,
        channel_name: String,
    },

    /// A top-level message to persist; successful persistence triggers the
    /// reply fan-out
    MainMessage {
        channel_id: String,
        channel_name: String,
        message: MessagePayload,
        user: UserProfile,
    },

    /// A reply to persist, carrying its parent's store-assigned identifier
    ReplyMessage {
        channel_id: String,
        channel_name: String,
        message: MessagePayload,
        user: UserProfile,
        main_message_id: i64,
    },
}

impl QueueItem {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
