use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub history: HistoryConfig,
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Connection details for the remote history API.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Base URL of the history API, e.g. `https://workspace.example.com/api/`
    pub url: String,
    /// Bearer credential for the acting identity
    pub token: String,
    /// User id of the acting identity, used for membership checks
    #[serde(default)]
    pub actor: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    /// Consumer group name shared by all worker processes
    #[serde(default = "default_group")]
    pub group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

/// Bounds for the single-pass history crawl.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Maximum channels fetched from the channel listing
    #[serde(default = "default_channel_limit")]
    pub channel_limit: u32,
    /// Maximum messages fetched per channel
    #[serde(default = "default_message_limit")]
    pub message_limit: u32,
}

fn default_group() -> String {
    "ingestors".to_string()
}

fn default_pool_size() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_channel_limit() -> u32 {
    1000
}

fn default_message_limit() -> u32 {
    1000
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("broker.group", "ingestors")?
            .set_default("database.pool_size", 5)?
            .set_default("database.connect_timeout_seconds", 10)?
            .set_default("ingest.channel_limit", 1000)?
            .set_default("ingest.message_limit", 1000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // HISTORY_URL, HISTORY_TOKEN, HISTORY_ACTOR, BROKER_URL, DATABASE_URL, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            channel_limit: default_channel_limit(),
            message_limit: default_message_limit(),
        }
    }
}
