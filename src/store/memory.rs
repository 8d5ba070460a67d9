//! In-memory record store.
//!
//! Mirrors the PostgreSQL store's idempotence and referential behavior
//! (including failing a reply insert whose parent is absent) so pipeline
//! tests can exercise the workers without a database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::history::UserProfile;

use super::models::{MainInsert, NewMainMessage, NewReplyMessage};
use super::record::{RecordStore, StoreError};

/// A stored main message row.
#[derive(Debug, Clone)]
pub struct MainRow {
    pub id: i64,
    pub external_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub reply_count: i32,
}

/// A stored reply row.
#[derive(Debug, Clone)]
pub struct ReplyRow {
    pub external_id: String,
    pub main_message_id: i64,
    pub channel_id: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// In-memory implementation of [`RecordStore`].
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<String, UserProfile>,
    channels: DashMap<String, String>,
    mains: Mutex<Vec<MainRow>>,
    replies: Mutex<Vec<ReplyRow>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until cleared; simulates a store outage for
    /// retry-path tests.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn user(&self, id: &str) -> Option<UserProfile> {
        self.users.get(id).map(|u| u.clone())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn main_messages(&self) -> Vec<MainRow> {
        self.mains.lock().unwrap().clone()
    }

    pub fn replies(&self) -> Vec<ReplyRow> {
        self.replies.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write failure injected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_user(&self, user: &UserProfile) -> Result<(), StoreError> {
        self.check_available()?;
        self.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn insert_channel_if_absent(&self, id: &str, name: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.channels
            .entry(id.to_string())
            .or_insert_with(|| name.to_string());
        Ok(())
    }

    async fn insert_main_message_if_absent(
        &self,
        message: &NewMainMessage,
    ) -> Result<MainInsert, StoreError> {
        self.check_available()?;
        let mut mains = self.mains.lock().unwrap();

        if mains.iter().any(|m| m.external_id == message.external_id) {
            return Ok(MainInsert::Duplicate);
        }

        let id = mains.len() as i64 + 1;
        mains.push(MainRow {
            id,
            external_id: message.external_id.clone(),
            channel_id: message.channel_id.clone(),
            user_id: message.user_id.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
            reply_count: message.reply_count,
        });

        Ok(MainInsert::Inserted(id))
    }

    async fn insert_reply_if_absent(&self, reply: &NewReplyMessage) -> Result<bool, StoreError> {
        self.check_available()?;

        // Foreign-key enforcement, same contract as the SQL schema
        if !self
            .mains
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.id == reply.main_message_id)
        {
            return Err(StoreError::MissingReferent(reply.main_message_id));
        }

        let mut replies = self.replies.lock().unwrap();
        if replies.iter().any(|r| r.external_id == reply.external_id) {
            return Ok(false);
        }

        replies.push(ReplyRow {
            external_id: reply.external_id.clone(),
            main_message_id: reply.main_message_id,
            channel_id: reply.channel_id.clone(),
            user_id: reply.user_id.clone(),
            text: reply.text.clone(),
            timestamp: reply.timestamp,
        });

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::parse_source_timestamp;

    fn main_message(external_id: &str) -> NewMainMessage {
        NewMainMessage {
            external_id: external_id.to_string(),
            channel_id: "C1".to_string(),
            user_id: "U1".to_string(),
            text: "hello".to_string(),
            timestamp: parse_source_timestamp("1712345678.000100").unwrap(),
            reply_count: 0,
        }
    }

    #[tokio::test]
    async fn test_upsert_user_latest_wins() {
        let store = MemoryStore::new();

        let first = UserProfile {
            id: "U1".to_string(),
            name: "ada".to_string(),
            real_name: "Ada".to_string(),
            email: String::new(),
        };
        store.upsert_user(&first).await.unwrap();

        let second = UserProfile {
            name: "ada-renamed".to_string(),
            ..first.clone()
        };
        store.upsert_user(&second).await.unwrap();

        assert_eq!(store.user_count(), 1);
        assert_eq!(store.user("U1").unwrap().name, "ada-renamed");
    }

    #[tokio::test]
    async fn test_main_message_duplicate_suppressed() {
        let store = MemoryStore::new();

        let outcome = store
            .insert_main_message_if_absent(&main_message("1.000"))
            .await
            .unwrap();
        assert_eq!(outcome, MainInsert::Inserted(1));

        let outcome = store
            .insert_main_message_if_absent(&main_message("1.000"))
            .await
            .unwrap();
        assert_eq!(outcome, MainInsert::Duplicate);
        assert_eq!(store.main_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_reply_requires_parent() {
        let store = MemoryStore::new();

        let reply = NewReplyMessage {
            external_id: "2.000".to_string(),
            main_message_id: 7,
            channel_id: "C1".to_string(),
            user_id: "U2".to_string(),
            text: "orphan".to_string(),
            timestamp: parse_source_timestamp("1712345679").unwrap(),
        };

        let result = store.insert_reply_if_absent(&reply).await;
        assert!(matches!(result, Err(StoreError::MissingReferent(7))));
        assert!(store.replies().is_empty());
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);

        let result = store
            .insert_main_message_if_absent(&main_message("1.000"))
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        store.set_fail_writes(false);
        assert!(store
            .insert_main_message_if_absent(&main_message("1.000"))
            .await
            .is_ok());
    }
}
