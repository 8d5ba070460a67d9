//! Contract for the relational record store.

use async_trait::async_trait;
use thiserror::Error;

use crate::history::UserProfile;

use super::models::{MainInsert, NewMainMessage, NewReplyMessage};

/// Errors that can occur during record store operations.
///
/// Workers treat every store error as transient and negatively-acknowledge
/// with requeue; in particular a foreign-key violation (message arriving
/// before its referenced user, reply arriving before its parent) resolves
/// itself through broker redelivery.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A referenced parent row does not exist yet
    #[error("referenced main message {0} does not exist")]
    MissingReferent(i64),

    /// Store is temporarily unavailable
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable keyed storage for users, channels, main messages and replies.
///
/// All operations are idempotent with respect to their natural keys, which
/// is what makes at-least-once delivery from the queue fabric safe.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or update a user; the latest write wins on every field.
    async fn upsert_user(&self, user: &UserProfile) -> Result<(), StoreError>;

    /// Insert a channel unless a row with this id already exists. Name
    /// drift is not reconciled.
    async fn insert_channel_if_absent(&self, id: &str, name: &str) -> Result<(), StoreError>;

    /// Insert a main message unless its external identifier is already
    /// present. Only a fresh insert yields the store-assigned identifier.
    async fn insert_main_message_if_absent(
        &self,
        message: &NewMainMessage,
    ) -> Result<MainInsert, StoreError>;

    /// Insert a reply unless its external identifier is already present.
    /// Returns whether a row was created.
    async fn insert_reply_if_absent(&self, reply: &NewReplyMessage) -> Result<bool, StoreError>;
}
