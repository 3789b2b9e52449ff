//! File Relay Server
//!
//! Accepts uploads over HTTP, deduplicates them by content hash, queues them
//! durably and delivers each unique file to remote storage.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_relay::broker::{self, is_amqp_url};
use file_relay::config::Config;
use file_relay::routes::create_router;
use file_relay::state::AppState;
use file_relay::{storage, HashStore, Publisher, Readiness, Relay, UploadWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "file_relay=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting File Relay v{}", env!("CARGO_PKG_VERSION"));
    // AMQP URLs carry credentials
    let transport = if is_amqp_url(&config.broker.url) {
        "amqp"
    } else {
        config.broker.url.as_str()
    };
    tracing::info!("Queue: {} ({})", config.broker.queue, transport);

    let broker = broker::connect(&config.broker)
        .await
        .context("failed to connect to broker")?;
    broker
        .declare_queue(&config.broker.queue)
        .await
        .context("failed to declare queue")?;

    let remote = storage::from_config(&config.remote);
    tracing::info!("Remote storage: {} (root {})", remote.describe(), config.remote.root);

    let shutdown = CancellationToken::new();
    let hash_store = HashStore::new();
    let readiness = Readiness::new();

    // Consumer side: worker drains into remote storage, relay feeds it from the queue
    let (worker, outcomes, worker_task) = UploadWorker::spawn(
        remote,
        config.remote.root.clone(),
        config.retry.clone(),
        readiness.clone(),
        shutdown.clone(),
    );
    let relay = Relay::new(
        hash_store.clone(),
        broker.clone(),
        config.broker.queue.clone(),
        worker,
        readiness.clone(),
    );
    let relay_stats = relay.stats();
    let relay_task = tokio::spawn(relay.run(outcomes, shutdown.clone()));

    // Producer side
    let publisher = Publisher::new(hash_store.clone(), broker.clone(), config.broker.queue.clone());
    let app_state = AppState::new(
        config.clone(),
        publisher,
        hash_store,
        broker.clone(),
        relay_stats,
        readiness,
    );
    let app = create_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    tracing::info!("File Relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    // Also covers the server exiting on its own
    shutdown.cancel();

    // The worker bounds its in-flight attempt by the grace period
    let drain_limit = config.retry.shutdown_grace() + Duration::from_secs(5);
    match tokio::time::timeout(drain_limit, relay_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!("Relay failed: {}", e),
        Ok(Err(e)) => tracing::error!("Relay task panicked: {}", e),
        Err(_) => tracing::warn!("Relay did not stop within {:?}", drain_limit),
    }
    if let Err(e) = worker_task.await {
        tracing::error!("Upload worker panicked: {}", e);
    }

    broker.close().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
