//! The bridge core: catalog, cache, connections, and publisher wired together.
//!
//! One [`Bridge`] instance owns all shared state. Handlers and background
//! tasks hold it behind an [`Arc`] and go through its methods; nothing global.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::backend::BackendClient;
use crate::cache::ChangeCache;
use crate::catalog::{Catalog, SignalDef, SignalKind, SignalValue};
use crate::config::BridgeConfig;
use crate::connection::{ConnectionManager, RetryPolicy};
use crate::error::{BridgeError, Result};
use crate::events::{EventLogEntry, SignalUpdate, StatusUpdate, epoch_secs};
use crate::publisher::EventPublisher;

/// One signal in the snapshot endpoint's response.
#[derive(Debug, Clone, Serialize)]
pub struct SignalSnapshot {
    pub name: String,
    pub signal_name: String,
    pub signal_type: &'static str,
    pub modbus_address: u16,
    pub connection: String,
    /// `None` when the signal has never been read or its reading went stale.
    pub value: Option<SignalValue>,
    /// Epoch seconds of the last successful read or accepted write.
    pub timestamp: Option<f64>,
}

/// The bridge's shared state and core operations.
pub struct Bridge {
    config: BridgeConfig,
    backend: Arc<BackendClient>,
    catalog: RwLock<Catalog>,
    cache: RwLock<ChangeCache>,
    connections: ConnectionManager,
    publisher: EventPublisher,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let backend = Arc::new(BackendClient::new(&config.backend_url)?);
        let policy = RetryPolicy {
            floor: std::time::Duration::from_secs(config.retry_floor_secs),
            ceiling: std::time::Duration::from_secs(config.retry_ceiling_secs),
        };
        Ok(Self {
            config,
            backend,
            catalog: RwLock::new(Catalog::default()),
            cache: RwLock::new(ChangeCache::new()),
            connections: ConnectionManager::new(policy),
            publisher: EventPublisher::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn backend(&self) -> &Arc<BackendClient> {
        &self.backend
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Fetch the catalog from the backend and install it. Returns the number
    /// of signals loaded.
    pub async fn load_catalog(&self) -> Result<usize> {
        let entries = self.backend.fetch_catalog().await?;
        let catalog = Catalog::from_connections(entries)?;
        let count = catalog.signals.len();
        self.apply_catalog(catalog).await;
        Ok(count)
    }

    /// Install a catalog, reconciling connections and resetting the cache so
    /// the next poll cycle republishes current values for the new signal set.
    pub async fn apply_catalog(&self, catalog: Catalog) {
        self.connections.sync_targets(&catalog.connections).await;
        let connections = catalog.connections.len();
        let signals = catalog.signals.len();
        *self.catalog.write().await = catalog;
        self.cache.write().await.clear();
        info!(connections, signals, "Catalog installed");

        let entry = EventLogEntry {
            event_type: "catalog_loaded".to_string(),
            status: "Success".to_string(),
            message: format!("{} signals across {} connections", signals, connections),
            timestamp: epoch_secs(),
        };
        self.publisher.publish_event_log(entry.clone());
        self.backend.notify_event(entry);
    }

    /// Clone of the current catalog.
    pub async fn catalog(&self) -> Catalog {
        self.catalog.read().await.clone()
    }

    /// Snapshot of every cataloged signal with its last known value.
    ///
    /// A reading older than the stale horizon (poll interval plus buffer) is
    /// reported with a `null` value; its timestamp is kept so consumers can
    /// show when the signal was last seen.
    pub async fn snapshot(&self) -> Vec<SignalSnapshot> {
        let catalog = self.catalog.read().await;
        let cache = self.cache.read().await;
        let now = epoch_secs();
        let stale_after = self.config.stale_after_secs();

        let mut snapshots: Vec<SignalSnapshot> = catalog
            .signals
            .values()
            .map(|def| {
                let cached = cache.get(&def.id);
                let (value, timestamp) = match cached {
                    Some(entry) if now - entry.timestamp <= stale_after => {
                        (Some(entry.value), Some(entry.timestamp))
                    }
                    Some(entry) => (None, Some(entry.timestamp)),
                    None => (None, None),
                };
                SignalSnapshot {
                    name: def.id.clone(),
                    signal_name: def.signal_name.clone(),
                    signal_type: def.signal_type.as_str(),
                    modbus_address: def.modbus_address,
                    connection: def.connection.clone(),
                    value,
                    timestamp,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Record a fresh reading, publishing and notifying the backend when it
    /// differs from the cached value. Returns whether it was a change.
    pub async fn apply_reading(
        &self,
        def: &SignalDef,
        value: SignalValue,
        source: &'static str,
    ) -> bool {
        let timestamp = epoch_secs();
        let changed = {
            let mut cache = self.cache.write().await;
            let changed = cache.is_change(&def.id, &value);
            cache.set(&def.id, value, timestamp);
            changed
        };
        if !changed {
            return false;
        }

        let update = SignalUpdate {
            name: def.id.clone(),
            signal_name: def.signal_name.clone(),
            value,
            timestamp,
            source,
        };
        // Operator writes skip the throttle so feedback is immediate.
        let immediate = source == "write_request";
        self.publisher.publish_signal_change(update.clone(), immediate);
        self.backend.notify_change(update);
        true
    }

    /// Write a value to a signal and record the result.
    ///
    /// Validation happens before any Modbus I/O: the signal must exist, be a
    /// writable kind, and the value must coerce to the kind's range. Returns
    /// the value as accepted on the wire.
    pub async fn write_signal(&self, signal_id: &str, requested: SignalValue) -> Result<SignalValue> {
        let def = {
            let catalog = self.catalog.read().await;
            catalog
                .signals
                .get(signal_id)
                .cloned()
                .ok_or_else(|| BridgeError::UnknownSignal(signal_id.to_string()))?
        };

        if !def.signal_type.writable() {
            return Err(BridgeError::write(format!(
                "signal '{}' has read-only kind {}",
                def.id,
                def.signal_type.as_str()
            )));
        }
        let accepted = coerce_write(def.signal_type, requested)?;

        let handle = self
            .connections
            .handle(&def.connection)
            .await
            .ok_or_else(|| {
                BridgeError::Connection(format!("connection '{}' is not managed", def.connection))
            })?;
        {
            let mut conn = handle.lock().await;
            conn.write_point(
                def.signal_type,
                def.modbus_address,
                accepted,
                self.config.modbus_timeout(),
            )
            .await?;
        }

        info!(signal = %def.id, value = ?accepted, "Write applied");
        self.apply_reading(&def, accepted, "write_request").await;
        Ok(accepted)
    }

    /// Aggregate status of every managed connection.
    pub async fn connection_status(&self) -> StatusUpdate {
        let connections = self.connections.status_snapshot().await;
        StatusUpdate {
            connected: connections.iter().any(|c| c.connected),
            connections,
            timestamp: epoch_secs(),
        }
    }

    /// Publish the current aggregate status to subscribers.
    pub async fn publish_status(&self) {
        let status = self.connection_status().await;
        self.publisher.publish_status(status);
    }

    /// Close all field connections. Called once on shutdown.
    pub async fn shutdown(&self) {
        self.connections.disconnect_all().await;
        info!("Bridge shut down");
    }
}

/// Coerce a requested write value into the target kind's range.
fn coerce_write(kind: SignalKind, requested: SignalValue) -> Result<SignalValue> {
    match kind {
        SignalKind::DigitalOutputCoil => match requested {
            SignalValue::Bool(state) => Ok(SignalValue::Bool(state)),
            SignalValue::Number(n) => Ok(SignalValue::Bool(n != 0.0)),
        },
        SignalKind::HoldingRegister => match requested {
            SignalValue::Number(n)
                if n.is_finite() && n.fract() == 0.0 && (0.0..=65535.0).contains(&n) =>
            {
                Ok(SignalValue::Number(n))
            }
            SignalValue::Number(n) => Err(BridgeError::write(format!(
                "value {} out of range for a 16-bit register",
                n
            ))),
            SignalValue::Bool(_) => Err(BridgeError::write(
                "register writes require a numeric value",
            )),
        },
        _ => {
            // Unreachable once the writable check has passed.
            warn!(kind = kind.as_str(), "Rejecting write to read-only kind");
            Err(BridgeError::write(format!(
                "kind {} is not writable",
                kind.as_str()
            )))
        }
    }
}
