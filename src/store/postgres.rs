//! PostgreSQL record store.
//!
//! Idempotence comes from `ON CONFLICT` forms on the natural keys: users
//! upsert (latest write wins), everything else is insert-if-absent. The
//! main-message insert uses `RETURNING id` with an optional fetch so a
//! suppressed duplicate is distinguishable from a fresh row.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;
use crate::history::UserProfile;

use super::models::{MainInsert, NewMainMessage, NewReplyMessage};
use super::record::{RecordStore, StoreError};

/// Record store backed by a PostgreSQL connection pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and bootstrap the schema. Connection failure here is fatal
    /// to startup.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await?;

        tracing::info!(pool_size = config.pool_size, "PostgreSQL connection pool created");

        let store = Self { pool };
        store.setup_schema().await?;
        Ok(store)
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn setup_schema(&self) -> Result<(), StoreError> {
        // Multiple statements, so this goes through the simple query
        // protocol rather than a prepared statement
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id VARCHAR(50) PRIMARY KEY,
                username VARCHAR(100) NOT NULL,
                real_name VARCHAR(200),
                email VARCHAR(200),
                created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS channels (
                id VARCHAR(50) PRIMARY KEY,
                name VARCHAR(200) NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS main_messages (
                id BIGSERIAL PRIMARY KEY,
                source_message_id VARCHAR(100) UNIQUE,
                channel_id VARCHAR(50) REFERENCES channels(id),
                user_id VARCHAR(50) REFERENCES users(id),
                text TEXT,
                timestamp TIMESTAMP WITH TIME ZONE NOT NULL,
                reply_count INTEGER DEFAULT 0,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS reply_messages (
                id BIGSERIAL PRIMARY KEY,
                source_message_id VARCHAR(100) UNIQUE,
                main_message_id BIGINT REFERENCES main_messages(id),
                channel_id VARCHAR(50) REFERENCES channels(id),
                user_id VARCHAR(50) REFERENCES users(id),
                text TEXT,
                timestamp TIMESTAMP WITH TIME ZONE NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_main_messages_channel ON main_messages(channel_id);
            CREATE INDEX IF NOT EXISTS idx_main_messages_user ON main_messages(user_id);
            CREATE INDEX IF NOT EXISTS idx_reply_messages_main ON reply_messages(main_message_id);
            CREATE INDEX IF NOT EXISTS idx_reply_messages_channel ON reply_messages(channel_id);
            CREATE INDEX IF NOT EXISTS idx_reply_messages_user ON reply_messages(user_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Database schema ready");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn upsert_user(&self, user: &UserProfile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, real_name, email)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET username = EXCLUDED.username,
                real_name = EXCLUDED.real_name,
                email = EXCLUDED.email
            "#,
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(&user.real_name)
        .bind(&user.email)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_channel_if_absent(&self, id: &str, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO channels (id, name)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_main_message_if_absent(
        &self,
        message: &NewMainMessage,
    ) -> Result<MainInsert, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO main_messages (source_message_id, channel_id, user_id, text, timestamp, reply_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_message_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&message.external_id)
        .bind(&message.channel_id)
        .bind(&message.user_id)
        .bind(&message.text)
        .bind(message.timestamp)
        .bind(message.reply_count)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((id,)) => MainInsert::Inserted(id),
            None => MainInsert::Duplicate,
        })
    }

    async fn insert_reply_if_absent(&self, reply: &NewReplyMessage) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO reply_messages (source_message_id, main_message_id, channel_id, user_id, text, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_message_id) DO NOTHING
            "#,
        )
        .bind(&reply.external_id)
        .bind(reply.main_message_id)
        .bind(&reply.channel_id)
        .bind(&reply.user_id)
        .bind(&reply.text)
        .bind(reply.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
