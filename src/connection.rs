//! Modbus/TCP session management.
//!
//! One [`ManagedConnection`] per field controller, each behind its own lock so
//! a slow or dead controller never blocks I/O to the others. Failed
//! connections back off exponentially between attempts (floor to ceiling,
//! doubling), and a successful connect resets the interval to the floor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::catalog::{ConnectionTarget, SignalKind, SignalValue};
use crate::error::{BridgeError, Result};
use crate::events::ConnectionStatus;

/// Retry interval bounds for a failed connection.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(5),
            ceiling: Duration::from_secs(60),
        }
    }
}

/// Raw payload of a count-1 read.
enum ReadPayload {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

/// Extract the single value from a count-1 read response. An empty payload
/// from a non-conforming device is a read error.
fn first_value(payload: ReadPayload, address: u16) -> Result<SignalValue> {
    let value = match &payload {
        ReadPayload::Bits(bits) => bits.first().copied().map(SignalValue::from),
        ReadPayload::Words(words) => words.first().copied().map(SignalValue::from),
    };
    value.ok_or_else(|| BridgeError::Read(format!("empty response at address {}", address)))
}

/// State for one field controller session.
pub struct ManagedConnection {
    pub target: ConnectionTarget,
    policy: RetryPolicy,
    ctx: Option<Context>,
    connected: bool,
    failures: u32,
    retry_interval: Duration,
    next_attempt: Option<Instant>,
    last_error: Option<String>,
}

impl ManagedConnection {
    pub fn new(target: ConnectionTarget, policy: RetryPolicy) -> Self {
        Self {
            target,
            policy,
            ctx: None,
            connected: false,
            failures: 0,
            retry_interval: policy.floor,
            next_attempt: None,
            last_error: None,
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether a connect attempt is allowed now.
    pub fn retry_due(&self, now: Instant) -> bool {
        match self.next_attempt {
            Some(at) => now >= at,
            None => true,
        }
    }

    fn record_success(&mut self) {
        self.connected = true;
        self.failures = 0;
        self.retry_interval = self.policy.floor;
        self.next_attempt = None;
        self.last_error = None;
    }

    /// Record a transport failure: drop the session and schedule the next
    /// attempt, doubling the interval up to the ceiling.
    fn record_failure(&mut self, error: String, now: Instant) {
        self.ctx = None;
        self.connected = false;
        self.failures += 1;
        self.retry_interval = if self.failures <= 1 {
            self.policy.floor
        } else {
            (self.retry_interval * 2).min(self.policy.ceiling)
        };
        self.next_attempt = Some(now + self.retry_interval);
        self.last_error = Some(error);
    }

    /// Drop the session without scheduling a retry delay.
    pub fn disconnect(&mut self) {
        self.ctx = None;
        self.connected = false;
        self.next_attempt = None;
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            name: self.target.name.clone(),
            connected: self.connected,
            last_error: self.last_error.clone(),
        }
    }

    // `&mut self`: a shared borrow held across the await would capture the
    // non-`Sync` client context and make every calling future non-`Send`.
    async fn resolve(&mut self) -> Result<SocketAddr> {
        let host = self.target.host.clone();
        let port = self.target.port;
        let mut addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| BridgeError::Connection(format!("cannot resolve {}: {}", host, e)))?;
        addrs
            .next()
            .ok_or_else(|| BridgeError::Connection(format!("no address for {}", host)))
    }

    /// Ensure a live session, connecting if needed.
    ///
    /// Returns [`BridgeError::NotReady`] without touching the network when the
    /// connection is inside its retry interval.
    pub async fn ensure_connected(&mut self, timeout: Duration) -> Result<()> {
        if self.connected && self.ctx.is_some() {
            return Ok(());
        }

        let now = Instant::now();
        if !self.retry_due(now) {
            return Err(BridgeError::NotReady(self.target.name.clone()));
        }

        let addr = match self.resolve().await {
            Ok(addr) => addr,
            Err(e) => {
                self.record_failure(e.to_string(), now);
                return Err(e);
            }
        };

        debug!(connection = %self.target.name, %addr, "Connecting");
        let attempt = tokio::time::timeout(timeout, tcp::connect_slave(addr, Slave(1))).await;
        match attempt {
            Ok(Ok(ctx)) => {
                self.ctx = Some(ctx);
                self.record_success();
                info!(connection = %self.target.name, %addr, "Connected");
                Ok(())
            }
            Ok(Err(e)) => {
                let msg = format!("connect to {} failed: {}", addr, e);
                self.record_failure(msg.clone(), Instant::now());
                warn!(
                    connection = %self.target.name,
                    retry_in = ?self.retry_interval,
                    "{}", msg
                );
                Err(BridgeError::Connection(msg))
            }
            Err(_) => {
                let msg = format!("connect to {} timed out", addr);
                self.record_failure(msg.clone(), Instant::now());
                warn!(
                    connection = %self.target.name,
                    retry_in = ?self.retry_interval,
                    "{}", msg
                );
                Err(BridgeError::Connection(msg))
            }
        }
    }

    /// Read one point.
    ///
    /// A transport failure demotes the connection (returned as
    /// [`BridgeError::Connection`]); a Modbus exception leaves it connected
    /// and is returned as [`BridgeError::Read`].
    pub async fn read_point(
        &mut self,
        kind: SignalKind,
        address: u16,
        timeout: Duration,
    ) -> Result<SignalValue> {
        self.ensure_connected(timeout).await?;
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| BridgeError::Connection("no session".to_string()))?;

        let io = async {
            match kind {
                SignalKind::DigitalOutputCoil => ctx
                    .read_coils(address, 1)
                    .await
                    .map(|r| r.map(ReadPayload::Bits)),
                SignalKind::DigitalInputContact => ctx
                    .read_discrete_inputs(address, 1)
                    .await
                    .map(|r| r.map(ReadPayload::Bits)),
                SignalKind::InputRegister => ctx
                    .read_input_registers(address, 1)
                    .await
                    .map(|r| r.map(ReadPayload::Words)),
                SignalKind::HoldingRegister => ctx
                    .read_holding_registers(address, 1)
                    .await
                    .map(|r| r.map(ReadPayload::Words)),
            }
        };

        match tokio::time::timeout(timeout, io).await {
            Ok(Ok(Ok(payload))) => first_value(payload, address),
            Ok(Ok(Err(exception))) => Err(BridgeError::Read(format!(
                "exception at address {}: {:?}",
                address, exception
            ))),
            Ok(Err(e)) => {
                let msg = format!("read at address {} failed: {}", address, e);
                self.record_failure(msg.clone(), Instant::now());
                Err(BridgeError::Connection(msg))
            }
            Err(_) => {
                let msg = format!("read at address {} timed out", address);
                self.record_failure(msg.clone(), Instant::now());
                Err(BridgeError::Connection(msg))
            }
        }
    }

    /// Write one point. Same error split as [`read_point`](Self::read_point).
    pub async fn write_point(
        &mut self,
        kind: SignalKind,
        address: u16,
        value: SignalValue,
        timeout: Duration,
    ) -> Result<()> {
        self.ensure_connected(timeout).await?;
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| BridgeError::Connection("no session".to_string()))?;

        enum WriteOp {
            Coil(bool),
            Register(u16),
        }
        let op = match (kind, value) {
            (SignalKind::DigitalOutputCoil, SignalValue::Bool(state)) => WriteOp::Coil(state),
            (SignalKind::HoldingRegister, SignalValue::Number(word)) => {
                WriteOp::Register(word as u16)
            }
            _ => {
                return Err(BridgeError::write(format!(
                    "value {:?} does not fit kind {}",
                    value,
                    kind.as_str()
                )));
            }
        };

        let io = async {
            match op {
                WriteOp::Coil(state) => ctx.write_single_coil(address, state).await,
                WriteOp::Register(word) => ctx.write_single_register(address, word).await,
            }
        };

        match tokio::time::timeout(timeout, io).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(exception))) => Err(BridgeError::Write(format!(
                "exception at address {}: {:?}",
                address, exception
            ))),
            Ok(Err(e)) => {
                let msg = format!("write at address {} failed: {}", address, e);
                self.record_failure(msg.clone(), Instant::now());
                Err(BridgeError::Connection(msg))
            }
            Err(_) => {
                let msg = format!("write at address {} timed out", address);
                self.record_failure(msg.clone(), Instant::now());
                Err(BridgeError::Connection(msg))
            }
        }
    }
}

/// The set of managed connections, kept in sync with the catalog.
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<Mutex<ManagedConnection>>>>,
    policy: RetryPolicy,
}

impl ConnectionManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Reconcile the managed set with the catalog's connection targets.
    ///
    /// New targets get a fresh entry, removed targets are dropped (closing
    /// their sessions), and surviving targets keep their session and retry
    /// state.
    pub async fn sync_targets(&self, targets: &HashMap<String, ConnectionTarget>) {
        let mut connections = self.connections.write().await;

        connections.retain(|name, _| {
            let keep = targets.contains_key(name);
            if !keep {
                info!(connection = %name, "Dropping connection removed from catalog");
            }
            keep
        });

        for (name, target) in targets {
            match connections.get(name) {
                Some(existing) => {
                    let mut conn = existing.lock().await;
                    if conn.target != *target {
                        info!(connection = %name, "Connection target changed, resetting session");
                        *conn = ManagedConnection::new(target.clone(), self.policy);
                    }
                }
                None => {
                    connections.insert(
                        name.clone(),
                        Arc::new(Mutex::new(ManagedConnection::new(
                            target.clone(),
                            self.policy,
                        ))),
                    );
                }
            }
        }
    }

    /// Handle to one connection's state, if managed.
    pub async fn handle(&self, name: &str) -> Option<Arc<Mutex<ManagedConnection>>> {
        self.connections.read().await.get(name).cloned()
    }

    /// Status of every managed connection, sorted by name.
    pub async fn status_snapshot(&self) -> Vec<ConnectionStatus> {
        let connections = self.connections.read().await;
        let mut statuses = Vec::with_capacity(connections.len());
        for conn in connections.values() {
            statuses.push(conn.lock().await.status());
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Close every session.
    pub async fn disconnect_all(&self) {
        let connections = self.connections.read().await;
        for conn in connections.values() {
            conn.lock().await.disconnect();
        }
    }
}
