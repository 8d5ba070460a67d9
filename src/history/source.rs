//! Contract for the remote history API.
//!
//! The ingestion pipeline only depends on this trait; the concrete HTTP
//! client lives in `http.rs` and tests substitute a scripted implementation.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{ChannelInfo, MessagePayload, UserProfile};

/// Errors returned by a history source.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Transport-level failure (connection, TLS, timeout)
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API answered but reported a failure
    #[error("{endpoint} failed: {message}")]
    Api { endpoint: String, message: String },

    /// Client could not be constructed from the given configuration
    #[error("invalid history configuration: {0}")]
    Config(String),
}

/// Read-only surface of the workspace history API.
///
/// All calls are bounded, synchronous request/response operations. Every
/// call except `join_channel` is side-effect free; the whole surface is safe
/// to retry.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// List workspace channels, up to `limit` (single page, no pagination).
    async fn list_channels(&self, limit: u32) -> Result<Vec<ChannelInfo>, HistoryError>;

    /// Fetch a channel's top-level message history, up to `limit`.
    async fn list_messages(
        &self,
        channel_id: &str,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, HistoryError>;

    /// Fetch the reply thread rooted at `parent_ts`.
    ///
    /// The thread includes the parent message itself; callers filter it out
    /// by exact timestamp match.
    async fn list_replies(
        &self,
        channel_id: &str,
        parent_ts: &str,
    ) -> Result<Vec<MessagePayload>, HistoryError>;

    /// Resolve a user id to its profile.
    async fn get_user(&self, user_id: &str) -> Result<UserProfile, HistoryError>;

    /// Join the acting identity to a channel. Idempotent upstream.
    async fn join_channel(&self, channel_id: &str) -> Result<(), HistoryError>;

    /// Whether the acting identity is already a member of the channel.
    async fn is_member(&self, channel_id: &str) -> Result<bool, HistoryError>;
}
