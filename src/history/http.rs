//! HTTP client for the workspace history API.
//!
//! Endpoints follow the conversational-workspace REST shape: every response
//! is an envelope with an `ok` flag and an optional `error` string.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;

use crate::config::HistoryConfig;

use super::source::{HistoryError, HistorySource};
use super::types::{ChannelInfo, MessagePayload, UserProfile};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP implementation of [`HistorySource`].
///
/// Holds a pooled `reqwest` client with the bearer credential installed as a
/// default header, plus the acting identity's user id for membership checks.
pub struct HttpHistorySource {
    client: reqwest::Client,
    base_url: String,
    actor_id: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    channels: Vec<WireChannel>,
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    text: String,
    #[serde(default, rename = "user")]
    author_id: String,
    ts: String,
    #[serde(default)]
    reply_count: i32,
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    user: Option<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    name: String,
    #[serde(default)]
    real_name: String,
    #[serde(default)]
    profile: WireUserProfile,
}

#[derive(Debug, Default, Deserialize)]
struct WireUserProfile {
    #[serde(default)]
    email: String,
}

impl HttpHistorySource {
    pub fn new(config: &HistoryConfig) -> Result<Self, HistoryError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|e| HistoryError::Config(format!("invalid credential: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            actor_id: config.actor.clone(),
        })
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, HistoryError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self.client.get(&url).query(params).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Api {
                endpoint: endpoint.to_string(),
                message: format!("status {status}: {body}"),
            });
        }

        Ok(response.json().await?)
    }

    fn check_ok(endpoint: &str, ok: bool, error: Option<String>) -> Result<(), HistoryError> {
        if ok {
            Ok(())
        } else {
            Err(HistoryError::Api {
                endpoint: endpoint.to_string(),
                message: error.unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn list_channels(&self, limit: u32) -> Result<Vec<ChannelInfo>, HistoryError> {
        let limit = limit.to_string();
        let envelope: Envelope = self
            .fetch("conversations.list", &[("limit", limit.as_str())])
            .await?;
        Self::check_ok("conversations.list", envelope.ok, envelope.error)?;

        Ok(envelope
            .channels
            .into_iter()
            .map(|c| ChannelInfo { id: c.id, name: c.name })
            .collect())
    }

    async fn list_messages(
        &self,
        channel_id: &str,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, HistoryError> {
        let limit = limit.to_string();
        let envelope: Envelope = self
            .fetch(
                "conversations.history",
                &[("channel", channel_id), ("limit", limit.as_str())],
            )
            .await?;
        Self::check_ok("conversations.history", envelope.ok, envelope.error)?;

        Ok(envelope.messages.into_iter().map(Into::into).collect())
    }

    async fn list_replies(
        &self,
        channel_id: &str,
        parent_ts: &str,
    ) -> Result<Vec<MessagePayload>, HistoryError> {
        let envelope: Envelope = self
            .fetch(
                "conversations.replies",
                &[("channel", channel_id), ("ts", parent_ts)],
            )
            .await?;
        Self::check_ok("conversations.replies", envelope.ok, envelope.error)?;

        Ok(envelope.messages.into_iter().map(Into::into).collect())
    }

    async fn get_user(&self, user_id: &str) -> Result<UserProfile, HistoryError> {
        let envelope: UserEnvelope = self.fetch("users.info", &[("user", user_id)]).await?;
        Self::check_ok("users.info", envelope.ok, envelope.error)?;

        let user = envelope.user.ok_or_else(|| HistoryError::Api {
            endpoint: "users.info".to_string(),
            message: format!("no profile returned for {user_id}"),
        })?;

        Ok(UserProfile {
            id: user.id,
            name: user.name,
            real_name: user.real_name,
            email: user.profile.email,
        })
    }

    async fn join_channel(&self, channel_id: &str) -> Result<(), HistoryError> {
        let envelope: Envelope = self
            .fetch("conversations.join", &[("channel", channel_id)])
            .await?;
        Self::check_ok("conversations.join", envelope.ok, envelope.error)
    }

    async fn is_member(&self, channel_id: &str) -> Result<bool, HistoryError> {
        let envelope: Envelope = self
            .fetch("conversations.members", &[("channel", channel_id)])
            .await?;
        Self::check_ok("conversations.members", envelope.ok, envelope.error)?;

        Ok(envelope.members.iter().any(|m| m == &self.actor_id))
    }
}

impl From<WireMessage> for MessagePayload {
    fn from(msg: WireMessage) -> Self {
        MessagePayload {
            text: msg.text,
            author_id: msg.author_id,
            ts: msg.ts,
            reply_count: msg.reply_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_error_decoding() {
        let json = r#"{"ok":false,"error":"channel_not_found"}"#;
        let envelope: Envelope = serde_json::from_str(json).unwrap();
        assert!(!envelope.ok);
        assert_eq!(envelope.error.as_deref(), Some("channel_not_found"));
        assert!(envelope.channels.is_empty());
    }

    #[test]
    fn test_user_envelope_decoding() {
        let json = r#"{
            "ok": true,
            "user": {
                "id": "U1",
                "name": "ada",
                "real_name": "Ada Lovelace",
                "profile": {"email": "ada@example.com"}
            }
        }"#;
        let envelope: UserEnvelope = serde_json::from_str(json).unwrap();
        let user = envelope.user.unwrap();
        assert_eq!(user.id, "U1");
        assert_eq!(user.profile.email, "ada@example.com");
    }

    #[test]
    fn test_user_envelope_missing_profile_defaults() {
        let json = r#"{"ok":true,"user":{"id":"U2","name":"bot"}}"#;
        let envelope: UserEnvelope = serde_json::from_str(json).unwrap();
        let user = envelope.user.unwrap();
        assert_eq!(user.real_name, "");
        assert_eq!(user.profile.email, "");
    }

    #[test]
    fn test_message_conversion() {
        let json = r#"{"text":"hi","user":"U1","ts":"1712345678.000100","reply_count":2}"#;
        let wire: WireMessage = serde_json::from_str(json).unwrap();
        let msg: MessagePayload = wire.into();
        assert_eq!(msg.author_id, "U1");
        assert_eq!(msg.reply_count, 2);
    }
}
