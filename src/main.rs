//! PLC bridge binary.
//!
//! Wires the bridge core to its background tasks: the poll loop, the batch
//! flusher, the heartbeat, subscriber cleanup, and the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use plc_bridge::config::{BridgeConfig, init_tracing};
use plc_bridge::{Bridge, poller, publisher, server};

/// Interval for pruning subscribers whose stream has gone away.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period for background tasks to finish after shutdown is signaled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = BridgeConfig::parse();
    config.validate().context("Invalid configuration")?;
    init_tracing(&config.log_level).map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!(
        backend = %config.backend_url,
        listen = %format!("{}:{}", config.listen_host, config.listen_port),
        poll_interval = config.poll_interval_secs,
        "Starting plc-bridge"
    );

    let bridge = Arc::new(Bridge::new(config).context("Failed to build bridge")?);

    // The first catalog load is fatal: without signals there is nothing to do.
    let signals = bridge
        .load_catalog()
        .await
        .context("Initial catalog load failed")?;
    info!(signals, "Initial catalog loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(poller::run(
        Arc::clone(&bridge),
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(run_flusher(
        Arc::clone(&bridge),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_heartbeat(
        Arc::clone(&bridge),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_cleanup(
        Arc::clone(&bridge),
        shutdown_rx.clone(),
    )));

    let mut server_task = tokio::spawn(server::serve(Arc::clone(&bridge), shutdown_rx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal");
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => warn!("HTTP surface exited early"),
                Ok(Err(e)) => warn!("HTTP surface failed: {}", e),
                Err(e) => warn!("HTTP surface task panicked: {}", e),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("Background task did not stop within grace period");
        }
    }
    if !server_task.is_finished()
        && tokio::time::timeout(SHUTDOWN_GRACE, server_task).await.is_err()
    {
        warn!("HTTP surface did not stop within grace period");
    }

    bridge.shutdown().await;
    info!("plc-bridge stopped");
    Ok(())
}

async fn run_flusher(bridge: Arc<Bridge>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(publisher::BATCH_WINDOW);
    loop {
        tokio::select! {
            _ = ticker.tick() => bridge.publisher().flush_pending(),
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_heartbeat(bridge: Arc<Bridge>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(publisher::HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if bridge.publisher().subscriber_count() > 0 {
                    bridge.publisher().heartbeat();
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_cleanup(bridge: Arc<Bridge>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => bridge.publisher().prune_closed(),
            _ = shutdown.changed() => break,
        }
    }
}
