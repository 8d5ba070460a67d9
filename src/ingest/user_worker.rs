//! User queue worker.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::broker::{Delivery, QueueFabric};
use crate::error::AppError;
use crate::metrics::{
    ITEMS_ACKED_TOTAL, ITEMS_CONSUMED_TOTAL, ITEMS_DROPPED_TOTAL, ITEMS_REQUEUED_TOTAL,
};
use crate::store::RecordStore;

use super::item::{QueueItem, USER_QUEUE};

/// Consumes user items one at a time and upserts them into the record
/// store. Stateless; safe against duplicate and out-of-order deliveries
/// because the upsert is idempotent.
pub struct UserWorker {
    fabric: Arc<dyn QueueFabric>,
    store: Arc<dyn RecordStore>,
    shutdown: broadcast::Sender<()>,
}

impl UserWorker {
    pub fn new(
        fabric: Arc<dyn QueueFabric>,
        store: Arc<dyn RecordStore>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            fabric,
            store,
            shutdown,
        }
    }

    /// Consume until shutdown. One delivery in flight at a time; the next
    /// delivery is not fetched until the current one is resolved.
    pub async fn run(&self) -> Result<(), AppError> {
        let mut consumer = self.fabric.consume(USER_QUEUE).await?;
        let mut shutdown_rx = self.shutdown.subscribe();

        tracing::info!(queue = USER_QUEUE, "User worker started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!(queue = USER_QUEUE, "User worker stopping");
                    break;
                }
                delivery = consumer.next() => {
                    match delivery {
                        Ok(Some(delivery)) => self.handle(delivery).await,
                        Ok(None) => {
                            tracing::warn!(queue = USER_QUEUE, "Consume stream ended");
                            break;
                        }
                        Err(e) => {
                            tracing::error!(queue = USER_QUEUE, error = %e, "Consume error, retrying");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle(&self, delivery: Box<dyn Delivery>) {
        ITEMS_CONSUMED_TOTAL.with_label_values(&[USER_QUEUE]).inc();

        let item = match QueueItem::decode(delivery.payload()) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(queue = USER_QUEUE, error = %e, "Poison payload, dropping");
                ITEMS_DROPPED_TOTAL.with_label_values(&[USER_QUEUE]).inc();
                if let Err(e) = delivery.nack(false).await {
                    tracing::warn!(error = %e, "Failed to nack poison delivery");
                }
                return;
            }
        };

        let user = match item {
            QueueItem::User { user } => user,
            other => {
                tracing::warn!(queue = USER_QUEUE, item = ?other, "Unexpected item kind, dropping");
                ITEMS_DROPPED_TOTAL.with_label_values(&[USER_QUEUE]).inc();
                if let Err(e) = delivery.nack(false).await {
                    tracing::warn!(error = %e, "Failed to nack delivery");
                }
                return;
            }
        };

        match self.store.upsert_user(&user).await {
            Ok(()) => {
                ITEMS_ACKED_TOTAL.with_label_values(&[USER_QUEUE]).inc();
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(user_id = %user.id, error = %e, "Failed to ack delivery");
                }
            }
            Err(e) => {
                tracing::warn!(user_id = %user.id, error = %e, "User upsert failed, requeueing");
                ITEMS_REQUEUED_TOTAL.with_label_values(&[USER_QUEUE]).inc();
                if let Err(e) = delivery.nack(true).await {
                    tracing::warn!(error = %e, "Failed to nack delivery");
                }
            }
        }
    }
}
