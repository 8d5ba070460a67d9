//! Redis Streams implementation of the queue fabric.
//!
//! Each queue is one stream with one consumer group. Publishing is `XADD`;
//! consumption is a blocking `XREADGROUP` loop with explicit `XACK`.
//! Negative acknowledgment with requeue re-publishes the payload before
//! acknowledging the old entry, so at-least-once delivery holds across the
//! swap. Entries claimed by a crashed process are recovered on startup by
//! draining the consumer's pending list before reading new entries.

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use async_trait::async_trait;

use crate::config::BrokerConfig;

use super::fabric::{BrokerError, Delivery, QueueConsumer, QueueFabric};

/// How long a consume call blocks waiting for a delivery before re-polling.
const BLOCK_MS: usize = 5_000;

/// Queue fabric backed by Redis Streams.
pub struct RedisQueueFabric {
    conn: ConnectionManager,
    group: String,
}

impl RedisQueueFabric {
    /// Connect to the broker. Establishing the managed connection doubles
    /// as the startup connectivity check.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = client.get_connection_manager().await?;

        tracing::info!(group = %config.group, "Queue fabric connection established");

        Ok(Self {
            conn,
            group: config.group.clone(),
        })
    }

    fn consumer_name(&self, queue: &str) -> String {
        // Stable per (group, queue) so a restarted process reclaims its own
        // pending entries.
        format!("{}-{}", self.group, queue)
    }
}

#[async_trait]
impl QueueFabric for RedisQueueFabric {
    async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(queue, &self.group, "0")
            .await;

        match created {
            Ok(()) => {
                tracing::info!(queue = %queue, group = %self.group, "Queue declared");
                Ok(())
            }
            // Group already exists from a previous run
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::Redis(e)),
        }
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _id: String = conn.xadd(queue, "*", &[("data", payload)]).await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, BrokerError> {
        Ok(Box::new(RedisConsumer {
            conn: self.conn.clone(),
            queue: queue.to_string(),
            group: self.group.clone(),
            consumer: self.consumer_name(queue),
            recovering: true,
        }))
    }
}

struct RedisConsumer {
    conn: ConnectionManager,
    queue: String,
    group: String,
    consumer: String,
    /// While true, read this consumer's pending list instead of new entries.
    recovering: bool,
}

#[async_trait]
impl QueueConsumer for RedisConsumer {
    async fn next(&mut self) -> Result<Option<Box<dyn Delivery>>, BrokerError> {
        loop {
            let cursor = if self.recovering { "0" } else { ">" };
            let options = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(1)
                .block(BLOCK_MS);

            let reply: StreamReadReply = self
                .conn
                .xread_options(&[self.queue.as_str()], &[cursor], &options)
                .await?;

            let entry = reply
                .keys
                .into_iter()
                .next()
                .and_then(|key| key.ids.into_iter().next());

            let entry = match entry {
                Some(entry) => entry,
                None if self.recovering => {
                    // Pending list drained, switch to new entries
                    self.recovering = false;
                    continue;
                }
                // Blocking read timed out, poll again
                None => continue,
            };

            let payload = match entry.map.get("data") {
                Some(value) => redis::from_redis_value::<Vec<u8>>(value)?,
                None => {
                    tracing::warn!(
                        queue = %self.queue,
                        entry_id = %entry.id,
                        "Stream entry without data field, discarding"
                    );
                    let mut conn = self.conn.clone();
                    let _: i64 = conn.xack(&self.queue, &self.group, &[&entry.id]).await?;
                    continue;
                }
            };

            return Ok(Some(Box::new(RedisDelivery {
                conn: self.conn.clone(),
                queue: self.queue.clone(),
                group: self.group.clone(),
                entry_id: entry.id,
                payload,
            })));
        }
    }
}

struct RedisDelivery {
    conn: ConnectionManager,
    queue: String,
    group: String,
    entry_id: String,
    payload: Vec<u8>,
}

impl RedisDelivery {
    async fn settle(&mut self) -> Result<(), BrokerError> {
        let _: i64 = self
            .conn
            .xack(&self.queue, &self.group, &[&self.entry_id])
            .await?;
        let _: i64 = self.conn.xdel(&self.queue, &[&self.entry_id]).await?;
        Ok(())
    }
}

#[async_trait]
impl Delivery for RedisDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
        self.settle().await
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            // Re-publish before settling so the message survives a crash
            // in between; duplicate delivery is the accepted failure mode.
            let _id: String = self
                .conn
                .xadd(&self.queue, "*", &[("data", self.payload.as_slice())])
                .await?;
        }
        self.settle().await
    }
}
