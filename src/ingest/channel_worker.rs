//! Channel queue worker.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::broker::{Delivery, QueueFabric};
use crate::error::AppError;
use crate::metrics::{
    ITEMS_ACKED_TOTAL, ITEMS_CONSUMED_TOTAL, ITEMS_DROPPED_TOTAL, ITEMS_REQUEUED_TOTAL,
};
use crate::store::RecordStore;

use super::item::{QueueItem, CHANNEL_QUEUE};

/// Consumes channel items one at a time; insert-if-absent, so a channel
/// discovered twice (or redelivered) stays a single row.
pub struct ChannelWorker {
    fabric: Arc<dyn QueueFabric>,
    store: Arc<dyn RecordStore>,
    shutdown: broadcast::Sender<()>,
}

impl ChannelWorker {
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

    pub async fn run(&self) -> Result<(), AppError> {
        let mut consumer = self.fabric.consume(CHANNEL_QUEUE).await?;
        let mut shutdown_rx = self.shutdown.subscribe();

        tracing::info!(queue = CHANNEL_QUEUE, "Channel worker started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!(queue = CHANNEL_QUEUE, "Channel worker stopping");
                    break;
                }
                delivery = consumer.next() => {
                    match delivery {
                        Ok(Some(delivery)) => self.handle(delivery).await,
                        Ok(None) => {
                            tracing::warn!(queue = CHANNEL_QUEUE, "Consume stream ended");
                            break;
                        }
                        Err(e) => {
                            tracing::error!(queue = CHANNEL_QUEUE, error = %e, "Consume error, retrying");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle(&self, delivery: Box<dyn Delivery>) {
        ITEMS_CONSUMED_TOTAL.with_label_values(&[CHANNEL_QUEUE]).inc();

        let item = match QueueItem::decode(delivery.payload()) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(queue = CHANNEL_QUEUE, error = %e, "Poison payload, dropping");
                ITEMS_DROPPED_TOTAL.with_label_values(&[CHANNEL_QUEUE]).inc();
                if let Err(e) = delivery.nack(false).await {
                    tracing::warn!(error = %e, "Failed to nack poison delivery");
                }
                return;
            }
        };

        let (channel_id, channel_name) = match item {
            QueueItem::Channel {
                channel_id,
                channel_name,
            } => (channel_id, channel_name),
            other => {
                tracing::warn!(queue = CHANNEL_QUEUE, item = ?other, "Unexpected item kind, dropping");
                ITEMS_DROPPED_TOTAL.with_label_values(&[CHANNEL_QUEUE]).inc();
                if let Err(e) = delivery.nack(false).await {
                    tracing::warn!(error = %e, "Failed to nack delivery");
                }
                return;
            }
        };

        match self
            .store
            .insert_channel_if_absent(&channel_id, &channel_name)
            .await
        {
            Ok(()) => {
                ITEMS_ACKED_TOTAL.with_label_values(&[CHANNEL_QUEUE]).inc();
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(channel_id = %channel_id, error = %e, "Failed to ack delivery");
                }
            }
            Err(e) => {
                tracing::warn!(
                    channel_id = %channel_id,
                    error = %e,
                    "Channel insert failed, requeueing"
                );
                ITEMS_REQUEUED_TOTAL.with_label_values(&[CHANNEL_QUEUE]).inc();
                if let Err(e) = delivery.nack(true).await {
                    tracing::warn!(error = %e, "Failed to nack delivery");
                }
            }
        }
    }
}
