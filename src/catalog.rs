//! Signal catalog: data model and the backend decode boundary.
//!
//! The backend returns connections with nested signals. Responses come in a
//! few historical shapes (a bare list, a `{success, data}` wrapper, and either
//! of those under a `message` envelope); all of them are decoded exactly once
//! here into a tagged result, so nothing downstream probes for keys.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BridgeError, Result};

/// Modbus signal kinds, named as the backend names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    /// Single-bit, read/write (digital output).
    #[serde(rename = "Digital Output Coil")]
    DigitalOutputCoil,
    /// Single-bit, read-only.
    #[serde(rename = "Digital Input Contact")]
    DigitalInputContact,
    /// 16-bit, read-only.
    #[serde(rename = "Input Register")]
    InputRegister,
    /// 16-bit, read/write.
    #[serde(rename = "Holding Register")]
    HoldingRegister,
}

impl SignalKind {
    /// Return the backend's string name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::DigitalOutputCoil => "Digital Output Coil",
            SignalKind::DigitalInputContact => "Digital Input Contact",
            SignalKind::InputRegister => "Input Register",
            SignalKind::HoldingRegister => "Holding Register",
        }
    }

    /// Whether writes are allowed for this kind.
    pub fn writable(&self) -> bool {
        matches!(
            self,
            SignalKind::DigitalOutputCoil | SignalKind::HoldingRegister
        )
    }
}

/// A signal value: boolean for the digital kinds, numeric for registers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Number(f64),
}

impl SignalValue {
    /// Exact, type-aware equality. A type mismatch counts as a difference.
    pub fn same_as(&self, other: &SignalValue) -> bool {
        match (self, other) {
            (SignalValue::Bool(a), SignalValue::Bool(b)) => a == b,
            (SignalValue::Number(a), SignalValue::Number(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for SignalValue {
    fn from(v: bool) -> Self {
        SignalValue::Bool(v)
    }
}

impl From<u16> for SignalValue {
    fn from(v: u16) -> Self {
        SignalValue::Number(f64::from(v))
    }
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        SignalValue::Number(v)
    }
}

/// A single addressable point on a connection.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalDef {
    /// Unique signal id.
    #[serde(rename = "name")]
    pub id: String,
    /// Human-readable display name.
    pub signal_name: String,
    /// Signal kind.
    pub signal_type: SignalKind,
    /// Address within the connection's address space.
    pub modbus_address: u16,
    /// Owning connection name, filled in at catalog build.
    #[serde(default)]
    pub connection: String,
}

/// One connection entry as the backend serializes it.
///
/// Host and port are optional at the decode boundary; entries missing either
/// are invalid and their signals are skipped at catalog build.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDef {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub signals: Vec<SignalDef>,
}

/// A validated field controller address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// The in-memory signal directory built from one catalog load.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Connection name -> target address.
    pub connections: HashMap<String, ConnectionTarget>,
    /// Signal id -> definition.
    pub signals: HashMap<String, SignalDef>,
}

impl Catalog {
    /// Build a catalog from decoded connection entries.
    ///
    /// Invalid connections (missing host or port) and their signals are
    /// skipped with a warning. An empty result is an error: the bridge has
    /// nothing to poll.
    pub fn from_connections(entries: Vec<ConnectionDef>) -> Result<Catalog> {
        let mut catalog = Catalog::default();

        for entry in entries {
            let (host, port) = match (entry.host, entry.port) {
                (Some(host), Some(port)) if !host.is_empty() && port != 0 => (host, port),
                _ => {
                    warn!(
                        connection = %entry.name,
                        signals = entry.signals.len(),
                        "Skipping connection with missing or invalid host/port"
                    );
                    continue;
                }
            };

            for mut signal in entry.signals {
                signal.connection = entry.name.clone();
                if let Some(previous) = catalog.signals.insert(signal.id.clone(), signal) {
                    warn!(signal = %previous.id, "Duplicate signal id in catalog, keeping the last");
                }
            }

            catalog.connections.insert(
                entry.name.clone(),
                ConnectionTarget {
                    name: entry.name,
                    host,
                    port,
                },
            );
        }

        if catalog.signals.is_empty() {
            return Err(BridgeError::catalog("catalog contains no signals"));
        }

        Ok(catalog)
    }

    /// Group signal definitions by owning connection, sorted for a stable
    /// polling order.
    pub fn signals_by_connection(&self) -> Vec<(String, Vec<SignalDef>)> {
        let mut grouped: HashMap<String, Vec<SignalDef>> = HashMap::new();
        for signal in self.signals.values() {
            grouped
                .entry(signal.connection.clone())
                .or_default()
                .push(signal.clone());
        }

        let mut result: Vec<(String, Vec<SignalDef>)> = grouped.into_iter().collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, signals) in &mut result {
            signals.sort_by(|a, b| a.id.cmp(&b.id));
        }
        result
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogPayload {
    Connections(Vec<ConnectionDef>),
    Wrapped {
        success: bool,
        #[serde(default)]
        data: Vec<ConnectionDef>,
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogEnvelope {
    Enveloped { message: CatalogPayload },
    Plain(CatalogPayload),
}

/// Decode a catalog response body into connection entries.
pub fn decode_catalog(body: &str) -> Result<Vec<ConnectionDef>> {
    let envelope: CatalogEnvelope = serde_json::from_str(body)
        .map_err(|e| BridgeError::catalog(format!("malformed catalog response: {}", e)))?;

    let payload = match envelope {
        CatalogEnvelope::Enveloped { message } => message,
        CatalogEnvelope::Plain(payload) => payload,
    };

    match payload {
        CatalogPayload::Connections(entries) => Ok(entries),
        CatalogPayload::Wrapped { success: true, data, .. } => Ok(data),
        CatalogPayload::Wrapped {
            success: false,
            message,
            ..
        } => Err(BridgeError::catalog(
            message.unwrap_or_else(|| "backend reported failure".to_string()),
        )),
    }
}
