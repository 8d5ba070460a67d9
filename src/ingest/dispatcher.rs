//! Dispatcher: walks the channel listing and seeds the queues.
//!
//! One bounded pass: channels, then each channel's messages, then each
//! message's author, publishing channel, user and main-message items.
//! Failures are contained to the smallest affected unit (a failing channel
//! is skipped, a message whose author cannot be resolved is dropped) and
//! the walk continues. Joins and publishes are not transactional; a
//! joined-but-unseeded channel is acceptable because rejoining is a no-op.

use std::sync::Arc;

use crate::broker::{BrokerError, QueueFabric};
use crate::config::IngestConfig;
use crate::error::AppError;
use crate::history::{HistoryError, HistorySource};
use crate::metrics::{CHANNELS_SKIPPED_TOTAL, ITEMS_PUBLISHED_TOTAL};

use super::item::{QueueItem, CHANNEL_QUEUE, MESSAGE_QUEUE, USER_QUEUE};

/// Outcome counters for one dispatch pass.
#[derive(Debug, Default, Clone)]
pub struct DispatchReport {
    /// Channels returned by the listing
    pub channels_listed: usize,
    /// Channels whose history was fetched and walked
    pub channels_seeded: usize,
    /// Channels skipped on join, publish or fetch failure
    pub channels_skipped: usize,
    /// Main-message items published
    pub messages_published: usize,
    /// Messages dropped on author lookup or publish failure
    pub messages_skipped: usize,
}

/// Seeds the three queues from a single bounded history crawl.
pub struct Dispatcher {
    history: Arc<dyn HistorySource>,
    fabric: Arc<dyn QueueFabric>,
    limits: IngestConfig,
}

impl Dispatcher {
    pub fn new(
        history: Arc<dyn HistorySource>,
        fabric: Arc<dyn QueueFabric>,
        limits: IngestConfig,
    ) -> Self {
        Self {
            history,
            fabric,
            limits,
        }
    }

    /// Run one dispatch pass. Only a channel-listing failure is fatal;
    /// everything below it degrades per channel or per message.
    pub async fn run(&self) -> Result<DispatchReport, AppError> {
        let channels = self.history.list_channels(self.limits.channel_limit).await?;

        let mut report = DispatchReport {
            channels_listed: channels.len(),
            ..Default::default()
        };

        tracing::info!(channels = channels.len(), "Dispatch pass started");

        for channel in &channels {
            if let Err(e) = self.ensure_joined(&channel.id).await {
                tracing::warn!(
                    channel_id = %channel.id,
                    error = %e,
                    "Failed to join channel, skipping"
                );
                report.channels_skipped += 1;
                CHANNELS_SKIPPED_TOTAL.inc();
                continue;
            }

            let channel_item = QueueItem::Channel {
                channel_id: channel.id.clone(),
                channel_name: channel.name.clone(),
            };
            if let Err(e) = self.publish(CHANNEL_QUEUE, &channel_item).await {
                tracing::warn!(
                    channel_id = %channel.id,
                    error = %e,
                    "Failed to publish channel item, skipping channel"
                );
                report.channels_skipped += 1;
                CHANNELS_SKIPPED_TOTAL.inc();
                continue;
            }

            let messages = match self
                .history
                .list_messages(&channel.id, self.limits.message_limit)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(
                        channel_id = %channel.id,
                        channel_name = %channel.name,
                        error = %e,
                        "Failed to fetch channel history, skipping channel"
                    );
                    report.channels_skipped += 1;
                    CHANNELS_SKIPPED_TOTAL.inc();
                    continue;
                }
            };

            for message in messages {
                let user = match self.history.get_user(&message.author_id).await {
                    Ok(user) => user,
                    Err(e) => {
                        // One unresolvable author drops one message, not
                        // the channel
                        tracing::debug!(
                            user_id = %message.author_id,
                            error = %e,
                            "Author lookup failed, dropping message"
                        );
                        report.messages_skipped += 1;
                        continue;
                    }
                };

                let user_item = QueueItem::User { user: user.clone() };
                if let Err(e) = self.publish(USER_QUEUE, &user_item).await {
                    tracing::warn!(
                        user_id = %user.id,
                        error = %e,
                        "Failed to publish user item, skipping message"
                    );
                    report.messages_skipped += 1;
                    continue;
                }

                let message_item = QueueItem::MainMessage {
                    channel_id: channel.id.clone(),
                    channel_name: channel.name.clone(),
                    message,
                    user,
                };
                match self.publish(MESSAGE_QUEUE, &message_item).await {
                    Ok(()) => report.messages_published += 1,
                    Err(e) => {
                        tracing::warn!(
                            channel_id = %channel.id,
                            error = %e,
                            "Failed to publish message item"
                        );
                        report.messages_skipped += 1;
                    }
                }
            }

            report.channels_seeded += 1;
        }

        tracing::info!(
            listed = report.channels_listed,
            seeded = report.channels_seeded,
            skipped = report.channels_skipped,
            messages = report.messages_published,
            "Dispatch pass complete"
        );

        Ok(report)
    }

    /// Join the channel unless the acting identity is already a member.
    async fn ensure_joined(&self, channel_id: &str) -> Result<(), HistoryError> {
        if self.history.is_member(channel_id).await? {
            return Ok(());
        }
        self.history.join_channel(channel_id).await
    }

    async fn publish(&self, queue: &str, item: &QueueItem) -> Result<(), BrokerError> {
        let payload = item.encode()?;
        self.fabric.publish(queue, &payload).await?;
        ITEMS_PUBLISHED_TOTAL.with_label_values(&[queue]).inc();
        Ok(())
    }
}
