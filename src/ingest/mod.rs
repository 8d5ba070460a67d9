mod channel_worker;
mod dispatcher;
mod item;
mod message_worker;
mod user_worker;

pub use channel_worker::ChannelWorker;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use item::{QueueItem, CHANNEL_QUEUE, INGEST_QUEUES, MESSAGE_QUEUE, USER_QUEUE};
pub use message_worker::MessageWorker;
pub use user_worker::UserWorker;
