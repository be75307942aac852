//! The poll scheduler.
//!
//! One cycle walks every cataloged signal grouped by connection. A connection
//! inside its retry interval is skipped outright; a transport failure mid-walk
//! demotes that connection and skips its remaining signals; a per-signal
//! Modbus exception is logged and the walk continues. One bad connection never
//! stalls the others or the cycle cadence.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::catalog::{SignalDef, SignalValue};
use crate::error::BridgeError;

/// Counters for one completed poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    /// Signals successfully read.
    pub read: usize,
    /// Readings that differed from the cache.
    pub changed: usize,
    /// Per-signal read errors (Modbus exceptions).
    pub errors: usize,
    /// Connections skipped (backing off or demoted mid-cycle).
    pub skipped_connections: usize,
}

/// Run one poll cycle over the current catalog.
pub async fn poll_cycle(bridge: &Bridge) -> PollStats {
    let mut stats = PollStats::default();
    let catalog = bridge.catalog().await;
    let timeout = bridge.config().modbus_timeout();

    for (connection_name, signals) in catalog.signals_by_connection() {
        let Some(handle) = bridge.connections().handle(&connection_name).await else {
            stats.skipped_connections += 1;
            continue;
        };

        // Readings are collected under the connection lock and applied after
        // releasing it, so cache and publisher work never extends the lock.
        let mut readings: Vec<(SignalDef, SignalValue)> = Vec::with_capacity(signals.len());
        {
            let mut conn = handle.lock().await;
            for def in signals {
                match conn
                    .read_point(def.signal_type, def.modbus_address, timeout)
                    .await
                {
                    Ok(value) => readings.push((def, value)),
                    Err(BridgeError::NotReady(_)) => {
                        debug!(connection = %connection_name, "Backing off, skipping cycle");
                        stats.skipped_connections += 1;
                        break;
                    }
                    Err(BridgeError::Connection(e)) => {
                        warn!(connection = %connection_name, "Connection lost mid-cycle: {}", e);
                        stats.skipped_connections += 1;
                        break;
                    }
                    Err(e) => {
                        warn!(signal = %def.id, "Read error: {}", e);
                        stats.errors += 1;
                    }
                }
            }
        }

        for (def, value) in readings {
            stats.read += 1;
            if bridge.apply_reading(&def, value, "plc_bridge").await {
                stats.changed += 1;
            }
        }
    }

    bridge.publish_status().await;
    stats
}

/// Poll loop: one cycle per interval until shutdown.
pub async fn run(bridge: Arc<Bridge>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(bridge.config().poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = poll_cycle(&bridge).await;
                if stats.changed > 0 || stats.errors > 0 {
                    debug!(
                        read = stats.read,
                        changed = stats.changed,
                        errors = stats.errors,
                        "Poll cycle complete"
                    );
                }
            }
            _ = shutdown.changed() => {
                debug!("Poll loop stopping");
                break;
            }
        }
    }
}
