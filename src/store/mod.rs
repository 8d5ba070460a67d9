mod memory;
mod models;
mod postgres;
mod record;

pub use memory::{MainRow, MemoryStore, ReplyRow};
pub use models::{MainInsert, NewMainMessage, NewReplyMessage};
pub use postgres::PostgresStore;
pub use record::{RecordStore, StoreError};
