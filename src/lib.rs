//! PLC bridge library.
//!
//! Bridges Modbus/TCP field controllers to an HTTP management backend and to
//! live dashboard subscribers: polls configured signals, detects value
//! changes, and fans them out over SSE and backend notifications.

pub mod backend;
pub mod bridge;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod poller;
pub mod publisher;
pub mod server;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
