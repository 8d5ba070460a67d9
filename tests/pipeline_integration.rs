//! End-to-end ingestion pipeline tests.
//!
//! These run the real dispatcher and workers over the in-memory queue
//! fabric and record store, with a scripted history source standing in for
//! the remote API.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use chatlog_ingestor::broker::{MemoryQueueFabric, QueueFabric};
use chatlog_ingestor::config::IngestConfig;
use chatlog_ingestor::history::{
    ChannelInfo, HistoryError, HistorySource, MessagePayload, UserProfile,
};
use chatlog_ingestor::ingest::{
    ChannelWorker, DispatchReport, Dispatcher, MessageWorker, QueueItem, UserWorker,
    CHANNEL_QUEUE, MESSAGE_QUEUE, USER_QUEUE,
};
use chatlog_ingestor::store::{MemoryStore, RecordStore};

// =============================================================================
// Scripted history source
// =============================================================================

#[derive(Default)]
struct ScriptedHistory {
    channels: Vec<ChannelInfo>,
    /// channel id -> top-level messages
    messages: HashMap<String, Vec<MessagePayload>>,
    /// "{channel_id}:{parent_ts}" -> thread including the parent entry
    threads: HashMap<String, Vec<MessagePayload>>,
    users: HashMap<String, UserProfile>,
    /// channel ids whose history fetch fails
    failing_histories: HashSet<String>,
    joined: Mutex<HashSet<String>>,
    reply_fetches: AtomicUsize,
}

impl ScriptedHistory {
    fn add_channel(&mut self, id: &str, name: &str) {
        self.channels.push(ChannelInfo {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    fn add_user(&mut self, id: &str, name: &str) {
        self.users.insert(
            id.to_string(),
            UserProfile {
                id: id.to_string(),
                name: name.to_string(),
                real_name: format!("{name} (real)"),
                email: format!("{name}@example.com"),
            },
        );
    }

    fn thread_key(channel_id: &str, parent_ts: &str) -> String {
        format!("{channel_id}:{parent_ts}")
    }
}

fn message(author: &str, ts: &str, text: &str) -> MessagePayload {
    MessagePayload {
        text: text.to_string(),
        author_id: author.to_string(),
        ts: ts.to_string(),
        reply_count: 0,
    }
}

#[async_trait]
impl HistorySource for ScriptedHistory {
    async fn list_channels(&self, limit: u32) -> Result<Vec<ChannelInfo>, HistoryError> {
        Ok(self.channels.iter().take(limit as usize).cloned().collect())
    }

    async fn list_messages(
        &self,
        channel_id: &str,
        _limit: u32,
    ) -> Result<Vec<MessagePayload>, HistoryError> {
        if self.failing_histories.contains(channel_id) {
            return Err(HistoryError::Api {
                endpoint: "conversations.history".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(self.messages.get(channel_id).cloned().unwrap_or_default())
    }

    async fn list_replies(
        &self,
        channel_id: &str,
        parent_ts: &str,
    ) -> Result<Vec<MessagePayload>, HistoryError> {
        self.reply_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .threads
            .get(&Self::thread_key(channel_id, parent_ts))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_user(&self, user_id: &str) -> Result<UserProfile, HistoryError> {
        self.users
            .get(user_id)
            .cloned()
            .ok_or_else(|| HistoryError::Api {
                endpoint: "users.info".to_string(),
                message: format!("unknown user {user_id}"),
            })
    }

    async fn join_channel(&self, channel_id: &str) -> Result<(), HistoryError> {
        self.joined.lock().unwrap().insert(channel_id.to_string());
        Ok(())
    }

    async fn is_member(&self, channel_id: &str) -> Result<bool, HistoryError> {
        Ok(self.joined.lock().unwrap().contains(channel_id))
    }
}

// =============================================================================
// Pipeline harness
// =============================================================================

struct Pipeline {
    fabric: Arc<MemoryQueueFabric>,
    store: Arc<MemoryStore>,
    history: Arc<ScriptedHistory>,
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Declare the queues and start all three workers.
    async fn start(history: ScriptedHistory) -> Self {
        let fabric = Arc::new(MemoryQueueFabric::new());
        let store = Arc::new(MemoryStore::new());
        let history = Arc::new(history);
        let (shutdown, _) = broadcast::channel(1);

        for queue in [USER_QUEUE, CHANNEL_QUEUE, MESSAGE_QUEUE] {
            fabric.declare(queue).await.unwrap();
        }

        let fabric_dyn: Arc<dyn QueueFabric> = fabric.clone();
        let store_dyn: Arc<dyn RecordStore> = store.clone();
        let history_dyn: Arc<dyn HistorySource> = history.clone();

        let user_worker = UserWorker::new(fabric_dyn.clone(), store_dyn.clone(), shutdown.clone());
        let channel_worker =
            ChannelWorker::new(fabric_dyn.clone(), store_dyn.clone(), shutdown.clone());
        let message_worker = MessageWorker::new(
            fabric_dyn.clone(),
            store_dyn.clone(),
            history_dyn,
            shutdown.clone(),
        );

        let handles = vec![
            tokio::spawn(async move {
                let _ = user_worker.run().await;
            }),
            tokio::spawn(async move {
                let _ = channel_worker.run().await;
            }),
            tokio::spawn(async move {
                let _ = message_worker.run().await;
            }),
        ];

        Self {
            fabric,
            store,
            history,
            shutdown,
            handles,
        }
    }

    async fn dispatch(&self) -> DispatchReport {
        let dispatcher = Dispatcher::new(
            self.history.clone() as Arc<dyn HistorySource>,
            self.fabric.clone() as Arc<dyn QueueFabric>,
            IngestConfig::default(),
        );
        dispatcher.run().await.unwrap()
    }

    async fn publish(&self, queue: &str, item: &QueueItem) {
        self.fabric
            .publish(queue, &item.encode().unwrap())
            .await
            .unwrap();
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// End-to-end scenarios
// =============================================================================

/// C1 has one message M1 (author U1) with replies R1 (U2) and R2 (U1).
/// One channel item, one main item then two reply items after its ack,
/// and user items from both the dispatcher and the fan-out.
#[tokio::test]
async fn test_full_pipeline_scenario() {
    let mut m1 = message("U1", "1000.000100", "root message");
    m1.reply_count = 2;
    let r1 = message("U2", "1000.000200", "first reply");
    let r2 = message("U1", "1000.000300", "second reply");

    let mut history = ScriptedHistory::default();
    history.add_channel("C1", "general");
    history.add_user("U1", "ada");
    history.add_user("U2", "grace");
    history.messages.insert("C1".to_string(), vec![m1.clone()]);
    history.threads.insert(
        ScriptedHistory::thread_key("C1", &m1.ts),
        vec![m1.clone(), r1, r2],
    );

    let pipeline = Pipeline::start(history).await;
    let report = pipeline.dispatch().await;

    assert_eq!(report.channels_listed, 1);
    assert_eq!(report.channels_seeded, 1);
    assert_eq!(report.messages_published, 1);

    wait_until("both replies stored", || pipeline.store.replies().len() == 2).await;
    wait_until("both users stored", || pipeline.store.user_count() == 2).await;
    wait_until("channel stored", || pipeline.store.channel_count() == 1).await;

    // Queue traffic: 1 channel item; 1 main + 2 replies on the message
    // queue; U1 from the dispatcher plus U2/U1 from the fan-out.
    assert_eq!(pipeline.fabric.published(CHANNEL_QUEUE), 1);
    assert_eq!(pipeline.fabric.published(MESSAGE_QUEUE), 3);
    assert_eq!(pipeline.fabric.published(USER_QUEUE), 3);

    let mains = pipeline.store.main_messages();
    assert_eq!(mains.len(), 1);
    assert_eq!(mains[0].external_id, "1000.000100");
    assert_eq!(mains[0].reply_count, 2);

    for reply in pipeline.store.replies() {
        assert_eq!(reply.main_message_id, mains[0].id);
    }

    assert_eq!(pipeline.history.reply_fetches.load(Ordering::SeqCst), 1);

    pipeline.stop().await;
}

/// Delivering the same main-message item twice stores exactly one row and
/// triggers the reply fan-out at most once.
#[tokio::test]
async fn test_duplicate_main_message_is_suppressed() {
    let m1 = message("U1", "2000.000100", "root");
    let r1 = message("U2", "2000.000200", "reply");

    let mut history = ScriptedHistory::default();
    history.add_user("U1", "ada");
    history.add_user("U2", "grace");
    history.threads.insert(
        ScriptedHistory::thread_key("C1", &m1.ts),
        vec![m1.clone(), r1],
    );

    let pipeline = Pipeline::start(history).await;

    let user = pipeline.history.users.get("U1").unwrap().clone();
    let item = QueueItem::MainMessage {
        channel_id: "C1".to_string(),
        channel_name: "general".to_string(),
        message: m1,
        user,
    };
    pipeline.publish(MESSAGE_QUEUE, &item).await;
    pipeline.publish(MESSAGE_QUEUE, &item).await;

    wait_until("reply stored", || pipeline.store.replies().len() == 1).await;
    wait_until("all message deliveries settled", || {
        // 2 duplicates + 1 fan-out reply
        pipeline.fabric.published(MESSAGE_QUEUE) == 3
    })
    .await;

    // Give the second (duplicate) delivery time to misbehave if it would
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(pipeline.store.main_messages().len(), 1);
    assert_eq!(pipeline.store.replies().len(), 1);
    assert_eq!(pipeline.history.reply_fetches.load(Ordering::SeqCst), 1);

    pipeline.stop().await;
}

/// Latest user write wins across redeliveries of the same id.
#[tokio::test]
async fn test_user_upsert_latest_wins() {
    let pipeline = Pipeline::start(ScriptedHistory::default()).await;

    let first = UserProfile {
        id: "U1".to_string(),
        name: "ada".to_string(),
        real_name: "Ada".to_string(),
        email: String::new(),
    };
    let second = UserProfile {
        name: "ada-renamed".to_string(),
        email: "ada@example.com".to_string(),
        ..first.clone()
    };

    pipeline
        .publish(USER_QUEUE, &QueueItem::User { user: first })
        .await;
    pipeline
        .publish(USER_QUEUE, &QueueItem::User { user: second })
        .await;

    wait_until("second write applied", || {
        pipeline
            .store
            .user("U1")
            .is_some_and(|u| u.name == "ada-renamed")
    })
    .await;

    assert_eq!(pipeline.store.user_count(), 1);
    assert_eq!(pipeline.store.user("U1").unwrap().email, "ada@example.com");

    pipeline.stop().await;
}

/// A reply arriving before its parent is requeued, not orphaned: the insert
/// fails on the missing referent and succeeds after redelivery once the
/// parent has landed.
#[tokio::test]
async fn test_reply_before_parent_is_retried() {
    let mut history = ScriptedHistory::default();
    history.add_user("U1", "ada");
    history.add_user("U2", "grace");

    let pipeline = Pipeline::start(history).await;

    let reply_item = QueueItem::ReplyMessage {
        channel_id: "C1".to_string(),
        channel_name: "general".to_string(),
        message: message("U2", "3000.000200", "early reply"),
        user: pipeline.history.users.get("U2").unwrap().clone(),
        // The parent's assigned id once it lands
        main_message_id: 1,
    };
    let main_item = QueueItem::MainMessage {
        channel_id: "C1".to_string(),
        channel_name: "general".to_string(),
        message: message("U1", "3000.000100", "late parent"),
        user: pipeline.history.users.get("U1").unwrap().clone(),
    };

    pipeline.publish(MESSAGE_QUEUE, &reply_item).await;
    pipeline.publish(MESSAGE_QUEUE, &main_item).await;

    wait_until("reply stored after retry", || {
        pipeline.store.replies().len() == 1
    })
    .await;

    assert!(pipeline.fabric.requeued(MESSAGE_QUEUE) >= 1);
    assert_eq!(pipeline.store.replies()[0].main_message_id, 1);

    pipeline.stop().await;
}

/// One failing channel history does not leak into its siblings: channels 1
/// and 3 are fully published, channel 2 contributes no message or user
/// items.
#[tokio::test]
async fn test_partial_failure_containment() {
    let mut history = ScriptedHistory::default();
    history.add_user("U1", "ada");
    for (id, name) in [("C1", "alpha"), ("C2", "bravo"), ("C3", "charlie")] {
        history.add_channel(id, name);
    }
    history.failing_histories.insert("C2".to_string());
    history.messages.insert(
        "C1".to_string(),
        vec![message("U1", "4000.000100", "hello from C1")],
    );
    history.messages.insert(
        "C3".to_string(),
        vec![message("U1", "4000.000300", "hello from C3")],
    );

    let fabric = Arc::new(MemoryQueueFabric::new());
    let history = Arc::new(history);
    let dispatcher = Dispatcher::new(
        history.clone() as Arc<dyn HistorySource>,
        fabric.clone() as Arc<dyn QueueFabric>,
        IngestConfig::default(),
    );

    let report = dispatcher.run().await.unwrap();

    assert_eq!(report.channels_listed, 3);
    assert_eq!(report.channels_seeded, 2);
    assert_eq!(report.channels_skipped, 1);
    assert_eq!(report.messages_published, 2);

    // The channel item precedes the history fetch, so all three land
    assert_eq!(fabric.published(CHANNEL_QUEUE), 3);
    assert_eq!(fabric.published(USER_QUEUE), 2);
    assert_eq!(fabric.published(MESSAGE_QUEUE), 2);

    // And the published message items belong to C1 and C3 only
    let mut consumer = fabric.consume(MESSAGE_QUEUE).await.unwrap();
    let mut seen = HashSet::new();
    for _ in 0..2 {
        let delivery = consumer.next().await.unwrap().unwrap();
        match QueueItem::decode(delivery.payload()).unwrap() {
            QueueItem::MainMessage { channel_id, .. } => {
                seen.insert(channel_id);
            }
            other => panic!("unexpected item: {other:?}"),
        }
        delivery.ack().await.unwrap();
    }
    assert_eq!(seen, HashSet::from(["C1".to_string(), "C3".to_string()]));
}

/// A payload that does not decode is dropped without requeue and never
/// reappears.
#[tokio::test]
async fn test_poison_payload_dropped() {
    let pipeline = Pipeline::start(ScriptedHistory::default()).await;

    pipeline
        .fabric
        .publish(USER_QUEUE, b"{ not json at all")
        .await
        .unwrap();

    let user = UserProfile {
        id: "U1".to_string(),
        name: "ada".to_string(),
        real_name: String::new(),
        email: String::new(),
    };
    pipeline
        .publish(USER_QUEUE, &QueueItem::User { user })
        .await;

    // The valid item behind the poison one lands, so the poison was
    // resolved, and it was not requeued
    wait_until("valid user stored", || pipeline.store.user_count() == 1).await;
    assert_eq!(pipeline.fabric.requeued(USER_QUEUE), 0);

    pipeline.stop().await;
}

/// The reply thread includes the parent entry; it must be filtered out by
/// exact timestamp match, yielding one reply item, not two.
#[tokio::test]
async fn test_parent_entry_filtered_from_thread() {
    let m1 = message("U1", "5000.000100", "root");
    let r1 = message("U2", "5000.000200", "only real reply");

    let mut history = ScriptedHistory::default();
    history.add_channel("C1", "general");
    history.add_user("U1", "ada");
    history.add_user("U2", "grace");
    history.messages.insert("C1".to_string(), vec![m1.clone()]);
    history.threads.insert(
        ScriptedHistory::thread_key("C1", &m1.ts),
        vec![m1.clone(), r1],
    );

    let pipeline = Pipeline::start(history).await;
    pipeline.dispatch().await;

    wait_until("single reply stored", || pipeline.store.replies().len() == 1).await;

    // 1 main + 1 reply; the parent entry produced nothing
    assert_eq!(pipeline.fabric.published(MESSAGE_QUEUE), 2);
    assert_eq!(pipeline.store.replies()[0].external_id, "5000.000200");

    pipeline.stop().await;
}
