//! Configuration for the PLC bridge.
//!
//! Everything is flag- or environment-supplied; there is no config file.

use std::time::Duration;

use clap::Parser;

use crate::error::{BridgeError, Result};

/// PLC bridge configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "plc-bridge")]
#[command(about = "Polls Modbus/TCP controllers and bridges changes to an HTTP backend")]
#[command(version)]
pub struct BridgeConfig {
    /// Base URL of the management backend.
    #[arg(long, env = "BRIDGE_BACKEND_URL", default_value = "http://localhost:8000")]
    pub backend_url: String,

    /// Poll interval in seconds.
    #[arg(long, env = "BRIDGE_POLL_INTERVAL", default_value_t = 1.0)]
    pub poll_interval_secs: f64,

    /// Listen address for the HTTP surface.
    #[arg(long, env = "BRIDGE_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Listen port for the HTTP surface.
    #[arg(long, env = "BRIDGE_LISTEN_PORT", default_value_t = 7654)]
    pub listen_port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Per-call Modbus I/O timeout in seconds.
    #[arg(long, env = "BRIDGE_MODBUS_TIMEOUT", default_value_t = 5)]
    pub modbus_timeout_secs: u64,

    /// Floor of the connection retry interval in seconds.
    #[arg(long, env = "BRIDGE_RETRY_FLOOR", default_value_t = 5)]
    pub retry_floor_secs: u64,

    /// Ceiling of the connection retry interval in seconds.
    #[arg(long, env = "BRIDGE_RETRY_CEILING", default_value_t = 60)]
    pub retry_ceiling_secs: u64,

    /// Extra age on top of the poll interval before a snapshot value is
    /// reported as unknown.
    #[arg(long, env = "BRIDGE_STALE_BUFFER", default_value_t = 10.0)]
    pub stale_buffer_secs: f64,
}

impl BridgeConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.backend_url.is_empty() {
            return Err(BridgeError::config("backend URL cannot be empty"));
        }
        if !(self.poll_interval_secs > 0.0) {
            return Err(BridgeError::config("poll interval must be positive"));
        }
        if self.modbus_timeout_secs == 0 {
            return Err(BridgeError::config("Modbus timeout must be at least 1s"));
        }
        if self.retry_floor_secs == 0 || self.retry_floor_secs > self.retry_ceiling_secs {
            return Err(BridgeError::config(format!(
                "invalid retry bounds: floor {}s, ceiling {}s",
                self.retry_floor_secs, self.retry_ceiling_secs
            )));
        }
        if self.stale_buffer_secs < 0.0 {
            return Err(BridgeError::config("stale buffer cannot be negative"));
        }
        Ok(())
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    /// Per-call Modbus timeout as a [`Duration`].
    pub fn modbus_timeout(&self) -> Duration {
        Duration::from_secs(self.modbus_timeout_secs)
    }

    /// Age past which a snapshot value is reported as unknown.
    pub fn stale_after_secs(&self) -> f64 {
        self.poll_interval_secs + self.stale_buffer_secs
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8000".to_string(),
            poll_interval_secs: 1.0,
            listen_host: "0.0.0.0".to_string(),
            listen_port: 7654,
            log_level: "info".to_string(),
            modbus_timeout_secs: 5,
            retry_floor_secs: 5,
            retry_ceiling_secs: 60,
            stale_buffer_secs: 10.0,
        }
    }
}

/// Initialize tracing with the configured level.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| BridgeError::config(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}
