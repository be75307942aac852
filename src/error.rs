//! Error types for the bridge.

use thiserror::Error;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog could not be fetched or decoded.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Connection attempt failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Connection is inside its retry interval; no attempt was made.
    #[error("Connection '{0}' is backing off")]
    NotReady(String),

    /// Read failed.
    #[error("Read failed: {0}")]
    Read(String),

    /// Write failed or was rejected.
    #[error("Write failed: {0}")]
    Write(String),

    /// Signal is not present in the catalog.
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    /// Backend request failed.
    #[error("Backend request failed: {0}")]
    Backend(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a catalog error.
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a write error.
    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Catalog(err.to_string())
    }
}
