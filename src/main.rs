use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chatlog_ingestor::broker::{QueueFabric, RedisQueueFabric};
use chatlog_ingestor::config::Settings;
use chatlog_ingestor::history::{HistorySource, HttpHistorySource};
use chatlog_ingestor::ingest::{
    ChannelWorker, Dispatcher, MessageWorker, UserWorker, INGEST_QUEUES,
};
use chatlog_ingestor::store::{PostgresStore, RecordStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration; missing required values abort here
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    // Startup connectivity checks: store, then broker. Any failure exits
    // non-zero before a single item moves.
    let store: Arc<dyn RecordStore> = Arc::new(PostgresStore::connect(&settings.database).await?);
    tracing::info!("Record store ready");

    let fabric: Arc<dyn QueueFabric> = Arc::new(RedisQueueFabric::connect(&settings.broker).await?);
    for queue in INGEST_QUEUES {
        fabric.declare(queue).await?;
    }
    tracing::info!("Queue fabric ready");

    let history: Arc<dyn HistorySource> = Arc::new(HttpHistorySource::new(&settings.history)?);

    // Workers run as independent tasks; the dispatcher runs here
    let (shutdown_tx, _) = broadcast::channel(1);

    let user_worker = UserWorker::new(fabric.clone(), store.clone(), shutdown_tx.clone());
    let user_handle = tokio::spawn(async move {
        if let Err(e) = user_worker.run().await {
            tracing::error!(error = %e, "User worker failed");
        }
    });

    let channel_worker = ChannelWorker::new(fabric.clone(), store.clone(), shutdown_tx.clone());
    let channel_handle = tokio::spawn(async move {
        if let Err(e) = channel_worker.run().await {
            tracing::error!(error = %e, "Channel worker failed");
        }
    });

    let message_worker = MessageWorker::new(
        fabric.clone(),
        store.clone(),
        history.clone(),
        shutdown_tx.clone(),
    );
    let message_handle = tokio::spawn(async move {
        if let Err(e) = message_worker.run().await {
            tracing::error!(error = %e, "Message worker failed");
        }
    });

    let dispatcher = Dispatcher::new(history, fabric, settings.ingest.clone());
    let report = dispatcher.run().await?;
    tracing::info!(
        channels = report.channels_seeded,
        messages = report.messages_published,
        "Dispatch complete, workers draining queues"
    );

    // Keep consuming (the fan-out feeds the message queue) until signalled
    wait_for_signal().await;

    let _ = shutdown_tx.send(());
    let _ = tokio::join!(user_handle, channel_handle, message_handle);

    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating shutdown");
        }
    }
}
