//! Contract for the durable queue fabric.
//!
//! This module defines the abstraction the pipeline needs from a message
//! broker: durable named queues, producer-side publish, and at-least-once
//! consumption with explicit acknowledge / negative-acknowledge. Adapters
//! (Redis Streams, in-memory) implement these traits interchangeably.

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during queue fabric operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A queue supports a single active consumer per process
    #[error("queue {0} already has an active consumer")]
    ConsumerTaken(String),

    /// The broker connection or channel is gone
    #[error("broker connection closed")]
    Closed,
}

/// A single delivery pulled from a queue.
///
/// The delivery stays in flight until exactly one of `ack` or `nack` is
/// called; dropping it without either leaves redelivery to the broker's
/// own unacknowledged-message handling.
#[async_trait]
pub trait Delivery: Send {
    /// Raw payload bytes as published.
    fn payload(&self) -> &[u8];

    /// Acknowledge successful processing; the broker forgets the message.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Negatively acknowledge. With `requeue` the message is redelivered
    /// later; without it the message is permanently dropped (poison).
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// A consumer bound to one queue.
///
/// `next` yields deliveries one at a time; callers resolve each delivery
/// before fetching the next, which bounds in-flight work to one message
/// per worker.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait for the next delivery. `Ok(None)` means the stream ended.
    async fn next(&mut self) -> Result<Option<Box<dyn Delivery>>, BrokerError>;
}

/// The queue fabric itself.
///
/// Implementations must be thread-safe (`Send + Sync`); the fabric handle is
/// shared between the dispatcher and all workers.
#[async_trait]
pub trait QueueFabric: Send + Sync {
    /// Ensure a durable queue exists. Idempotent; also serves as the
    /// startup connectivity check.
    async fn declare(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish a payload onto a queue.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, BrokerError>;
}
