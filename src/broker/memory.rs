//! In-memory queue fabric.
//!
//! Process-local implementation of the [`QueueFabric`] contract backed by
//! unbounded channels. Messages are lost on restart; nack-with-requeue
//! re-publishes to the back of the queue. Used by the integration tests and
//! as a broker-less development mode.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use super::fabric::{BrokerError, Delivery, QueueConsumer, QueueFabric};

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    published: AtomicU64,
    requeued: AtomicU64,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            published: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        }
    }
}

/// In-memory implementation of [`QueueFabric`].
#[derive(Default)]
pub struct MemoryQueueFabric {
    queues: DashMap<String, Arc<MemoryQueue>>,
}

impl MemoryQueueFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new()))
            .clone()
    }

    /// Total payloads published to a queue since creation.
    pub fn published(&self, queue: &str) -> u64 {
        self.queues
            .get(queue)
            .map(|q| q.published.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Total nack-with-requeue redeliveries on a queue.
    pub fn requeued(&self, queue: &str) -> u64 {
        self.queues
            .get(queue)
            .map(|q| q.requeued.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[async_trait]
impl QueueFabric for MemoryQueueFabric {
    async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
        self.queue(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let q = self.queue(queue);
        q.tx.send(payload.to_vec()).map_err(|_| BrokerError::Closed)?;
        q.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, BrokerError> {
        let q = self.queue(queue);
        let rx = q
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| BrokerError::ConsumerTaken(queue.to_string()))?;

        Ok(Box::new(MemoryConsumer { rx, queue: q }))
    }
}

struct MemoryConsumer {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Box<dyn Delivery>>, BrokerError> {
        match self.rx.recv().await {
            Some(payload) => Ok(Some(Box::new(MemoryDelivery {
                payload,
                queue: self.queue.clone(),
            }))),
            None => Ok(None),
        }
    }
}

struct MemoryDelivery {
    payload: Vec<u8>,
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            self.queue
                .tx
                .send(self.payload)
                .map_err(|_| BrokerError::Closed)?;
            self.queue.requeued.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
