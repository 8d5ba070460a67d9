mod fabric;
mod memory;
mod redis;

pub use fabric::{BrokerError, Delivery, QueueConsumer, QueueFabric};
pub use memory::MemoryQueueFabric;
pub use self::redis::RedisQueueFabric;
