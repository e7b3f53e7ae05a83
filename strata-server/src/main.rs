//! Strata Server - broker write API and storage node in one process

mod api;
mod config;

use api::AppState;
use config::ServerConfig;
use std::sync::Arc;
use std::time::Duration;
use strata_core::replica::{ChannelManager, ReplicaReceiver, StreamSenderFactory};
use strata_core::storage::StorageEngine;
use strata_core::ShardState;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Time given to replication streams to deliver their last chunks
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config = ServerConfig::load()?;

    info!("Starting Strata server...");
    info!("Data directory: {:?}", config.data_dir);
    info!("HTTP server: http://{}", config.http_addr);
    info!("Replica receiver: {}", config.replica_addr);

    // Storage role
    let storage_ctx = CancellationToken::new();
    let engine = Arc::new(StorageEngine::new(config.storage_config())?);
    let receiver = Arc::new(ReplicaReceiver::new(engine.clone()));
    let replica_listener = TcpListener::bind(config.replica_addr).await?;
    let replica_task = tokio::spawn(receiver.clone().serve(replica_listener, storage_ctx.clone()));
    let flush_task = tokio::spawn(run_periodic_flush(
        engine.clone(),
        config.flush_interval(),
        storage_ctx.clone(),
    ));

    // Broker role
    let broker_ctx = CancellationToken::new();
    let broker = Arc::new(ChannelManager::new(
        &broker_ctx,
        config.channel.clone(),
        Arc::new(StreamSenderFactory),
    ));
    let live_nodes = config.live_nodes();
    for db in &config.databases {
        broker.register_database(&db.name, db.num_of_shards)?;
        for shard_id in 0..db.num_of_shards {
            let state = ShardState::new(shard_id, config.node_id, vec![config.node_id]);
            broker.sync_shard_state(&db.name, state, live_nodes.clone())?;
        }
    }

    // Create router
    let app = api::create_router(AppState {
        broker: broker.clone(),
        storage: Some(engine.clone()),
        receiver: Some(receiver.clone()),
    });

    // Start server
    let listener = TcpListener::bind(config.http_addr).await?;
    info!("Strata server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain broker channels, then let the receiver consume what they sent
    broker.shutdown().await;
    drop(broker);
    if !receiver.drain(DRAIN_TIMEOUT).await {
        warn!("replication streams still open after {:?}", DRAIN_TIMEOUT);
    }

    storage_ctx.cancel();
    replica_task.await??;
    flush_task.await?;

    let files = engine.flush_all()?;
    info!(files, "Strata server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn run_periodic_flush(engine: Arc<StorageEngine>, period: Duration, ctx: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = ticker.tick() => {
                let engine = engine.clone();
                match tokio::task::spawn_blocking(move || engine.flush_all()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("Periodic flush failed: {}", e),
                    Err(e) => error!("Periodic flush task failed: {}", e),
                }
            }
        }
    }
}
