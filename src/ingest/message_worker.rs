//! Message queue worker: main messages, replies, and the reply fan-out.
//!
//! A main message is acknowledged as soon as its row is durable, *before*
//! the reply thread is fetched. A crash mid-fan-out therefore never causes
//! endless redelivery of the parent; the cost is that replies discovered
//! after the ack can be lost if their publish fails. Duplicate deliveries
//! are acknowledged without fan-out, which bounds reply-fetch amplification
//! under redelivery.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::broker::{BrokerError, Delivery, QueueFabric};
use crate::error::AppError;
use crate::history::{parse_source_timestamp, HistorySource, MessagePayload};
use crate::metrics::{
    ITEMS_ACKED_TOTAL, ITEMS_CONSUMED_TOTAL, ITEMS_DROPPED_TOTAL, ITEMS_PUBLISHED_TOTAL,
    ITEMS_REQUEUED_TOTAL, REPLIES_PUBLISHED_TOTAL,
};
use crate::store::{MainInsert, NewMainMessage, NewReplyMessage, RecordStore};

use super::item::{QueueItem, MESSAGE_QUEUE, USER_QUEUE};

/// Consumes main-message and reply items from the message queue. The
/// main-message path feeds the queue it consumes from: a fresh insert
/// triggers a reply-thread fetch whose items land back on this queue.
pub struct MessageWorker {
    fabric: Arc<dyn QueueFabric>,
    store: Arc<dyn RecordStore>,
    history: Arc<dyn HistorySource>,
    shutdown: broadcast::Sender<()>,
}

impl MessageWorker {
    pub fn new(
        fabric: Arc<dyn QueueFabric>,
        store: Arc<dyn RecordStore>,
        history: Arc<dyn HistorySource>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            fabric,
            store,
            history,
            shutdown,
        }
    }

    pub async fn run(&self) -> Result<(), AppError> {
        let mut consumer = self.fabric.consume(MESSAGE_QUEUE).await?;
        let mut shutdown_rx = self.shutdown.subscribe();

        tracing::info!(queue = MESSAGE_QUEUE, "Message worker started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!(queue = MESSAGE_QUEUE, "Message worker stopping");
                    break;
                }
                delivery = consumer.next() => {
                    match delivery {
                        Ok(Some(delivery)) => self.handle(delivery).await,
                        Ok(None) => {
                            tracing::warn!(queue = MESSAGE_QUEUE, "Consume stream ended");
                            break;
                        }
                        Err(e) => {
                            tracing::error!(queue = MESSAGE_QUEUE, error = %e, "Consume error, retrying");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle(&self, delivery: Box<dyn Delivery>) {
        ITEMS_CONSUMED_TOTAL.with_label_values(&[MESSAGE_QUEUE]).inc();

        let item = match QueueItem::decode(delivery.payload()) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(queue = MESSAGE_QUEUE, error = %e, "Poison payload, dropping");
                self.drop_delivery(delivery).await;
                return;
            }
        };

        match item {
            QueueItem::MainMessage {
                channel_id,
                channel_name,
                message,
                user,
            } => {
                self.handle_main(delivery, channel_id, channel_name, message, user.id)
                    .await
            }
            QueueItem::ReplyMessage {
                channel_id,
                message,
                user,
                main_message_id,
                ..
            } => {
                self.handle_reply(delivery, channel_id, message, user.id, main_message_id)
                    .await
            }
            other => {
                tracing::warn!(queue = MESSAGE_QUEUE, item = ?other, "Unexpected item kind, dropping");
                self.drop_delivery(delivery).await;
            }
        }
    }

    async fn handle_main(
        &self,
        delivery: Box<dyn Delivery>,
        channel_id: String,
        channel_name: String,
        message: MessagePayload,
        author_id: String,
    ) {
        let timestamp = match parse_source_timestamp(&message.ts) {
            Some(ts) => ts,
            None => {
                // Retrying a malformed timestamp can never succeed
                tracing::warn!(ts = %message.ts, "Unparseable message timestamp, dropping");
                self.drop_delivery(delivery).await;
                return;
            }
        };

        let new_message = NewMainMessage {
            external_id: message.ts.clone(),
            channel_id: channel_id.clone(),
            user_id: author_id,
            text: message.text.clone(),
            timestamp,
            reply_count: message.reply_count,
        };

        match self.store.insert_main_message_if_absent(&new_message).await {
            Err(e) => {
                tracing::warn!(
                    external_id = %message.ts,
                    error = %e,
                    "Main message insert failed, requeueing"
                );
                ITEMS_REQUEUED_TOTAL.with_label_values(&[MESSAGE_QUEUE]).inc();
                if let Err(e) = delivery.nack(true).await {
                    tracing::warn!(error = %e, "Failed to nack delivery");
                }
            }
            Ok(MainInsert::Duplicate) => {
                // Already fully processed in a prior delivery; no fan-out
                tracing::debug!(external_id = %message.ts, "Duplicate main message suppressed");
                ITEMS_ACKED_TOTAL.with_label_values(&[MESSAGE_QUEUE]).inc();
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(error = %e, "Failed to ack delivery");
                }
            }
            Ok(MainInsert::Inserted(assigned_id)) => {
                // Ack first: the message is durable, so the fan-out must
                // not hold the delivery hostage
                ITEMS_ACKED_TOTAL.with_label_values(&[MESSAGE_QUEUE]).inc();
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(error = %e, "Failed to ack delivery");
                }
                self.fan_out(&channel_id, &channel_name, &message, assigned_id)
                    .await;
            }
        }
    }

    async fn handle_reply(
        &self,
        delivery: Box<dyn Delivery>,
        channel_id: String,
        message: MessagePayload,
        author_id: String,
        main_message_id: i64,
    ) {
        let timestamp = match parse_source_timestamp(&message.ts) {
            Some(ts) => ts,
            None => {
                tracing::warn!(ts = %message.ts, "Unparseable reply timestamp, dropping");
                self.drop_delivery(delivery).await;
                return;
            }
        };

        let new_reply = NewReplyMessage {
            external_id: message.ts.clone(),
            main_message_id,
            channel_id,
            user_id: author_id,
            text: message.text,
            timestamp,
        };

        match self.store.insert_reply_if_absent(&new_reply).await {
            // Duplicate-suppressed inserts ack as well
            Ok(_) => {
                ITEMS_ACKED_TOTAL.with_label_values(&[MESSAGE_QUEUE]).inc();
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(error = %e, "Failed to ack delivery");
                }
            }
            Err(e) => {
                tracing::warn!(
                    external_id = %new_reply.external_id,
                    main_message_id,
                    error = %e,
                    "Reply insert failed, requeueing"
                );
                ITEMS_REQUEUED_TOTAL.with_label_values(&[MESSAGE_QUEUE]).inc();
                if let Err(e) = delivery.nack(true).await {
                    tracing::warn!(error = %e, "Failed to nack delivery");
                }
            }
        }
    }

    /// Fetch the reply thread for a freshly inserted main message and
    /// publish one reply item (plus its author's user item) per reply.
    /// Failures here are logged and contained per reply; the parent is
    /// already acknowledged.
    async fn fan_out(
        &self,
        channel_id: &str,
        channel_name: &str,
        parent: &MessagePayload,
        parent_assigned_id: i64,
    ) {
        let thread = match self.history.list_replies(channel_id, &parent.ts).await {
            Ok(thread) => thread,
            Err(e) => {
                tracing::warn!(
                    channel_id = %channel_id,
                    parent_ts = %parent.ts,
                    error = %e,
                    "Reply fetch failed, replies for this message are lost"
                );
                return;
            }
        };

        for reply in thread {
            // The thread includes the parent message itself
            if reply.ts == parent.ts {
                continue;
            }

            let user = match self.history.get_user(&reply.author_id).await {
                Ok(user) => user,
                Err(e) => {
                    tracing::debug!(
                        user_id = %reply.author_id,
                        error = %e,
                        "Reply author lookup failed, skipping reply"
                    );
                    continue;
                }
            };

            let user_item = QueueItem::User { user: user.clone() };
            if let Err(e) = self.publish(USER_QUEUE, &user_item).await {
                tracing::warn!(
                    user_id = %user.id,
                    error = %e,
                    "Failed to publish reply author, skipping reply"
                );
                continue;
            }

            let reply_item = QueueItem::ReplyMessage {
                channel_id: channel_id.to_string(),
                channel_name: channel_name.to_string(),
                message: reply,
                user,
                main_message_id: parent_assigned_id,
            };
            match self.publish(MESSAGE_QUEUE, &reply_item).await {
                Ok(()) => REPLIES_PUBLISHED_TOTAL.inc(),
                Err(e) => {
                    tracing::warn!(
                        parent_ts = %parent.ts,
                        error = %e,
                        "Failed to publish reply item"
                    );
                }
            }
        }
    }

    async fn publish(&self, queue: &str, item: &QueueItem) -> Result<(), BrokerError> {
        let payload = item.encode()?;
        self.fabric.publish(queue, &payload).await?;
        ITEMS_PUBLISHED_TOTAL.with_label_values(&[queue]).inc();
        Ok(())
    }

    async fn drop_delivery(&self, delivery: Box<dyn Delivery>) {
        ITEMS_DROPPED_TOTAL.with_label_values(&[MESSAGE_QUEUE]).inc();
        if let Err(e) = delivery.nack(false).await {
            tracing::warn!(error = %e, "Failed to nack poison delivery");
        }
    }
}
