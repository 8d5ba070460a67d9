mod settings;

pub use settings::{BrokerConfig, DatabaseConfig, HistoryConfig, IngestConfig, Settings};
