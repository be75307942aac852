//! HTTP client for the management backend.
//!
//! All notification calls are best-effort: there is no retry queue. A failed
//! call is logged and forgotten; the change cache stays authoritative and the
//! backend catches up on the next change or by re-querying the snapshot.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::catalog::{ConnectionDef, decode_catalog};
use crate::error::{BridgeError, Result};
use crate::events::{EventLogEntry, SignalUpdate};

/// Per-request timeout for backend calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the management backend's bridge API.
pub struct BackendClient {
    base_url: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::backend(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/api/method/plc.{}", self.base_url, method)
    }

    /// Fetch the signal catalog.
    pub async fn fetch_catalog(&self) -> Result<Vec<ConnectionDef>> {
        let url = self.url("get_signals");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BridgeError::catalog(format!("catalog fetch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BridgeError::catalog(format!(
                "catalog fetch returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::catalog(format!("catalog body read failed: {}", e)))?;
        decode_catalog(&body)
    }

    /// Report one accepted value change.
    pub async fn report_change(&self, update: &SignalUpdate) -> Result<()> {
        let body = json!({
            "name": update.name,
            "value": update.value,
            "timestamp": update.timestamp,
        });
        self.post("signal_update", &body).await
    }

    /// Ask the backend to run any automation bound to a signal.
    pub async fn trigger_actions(&self, signal_id: &str, value: &serde_json::Value) -> Result<()> {
        let body = json!({
            "name": signal_id,
            "value": value,
        });
        self.post("trigger_actions", &body).await
    }

    /// Forward an operational log entry to the backend.
    pub async fn log_event(&self, entry: &EventLogEntry) -> Result<()> {
        let body = serde_json::to_value(entry)?;
        self.post("log_event", &body).await
    }

    async fn post(&self, method: &str, body: &serde_json::Value) -> Result<()> {
        let url = self.url(method);
        let response = self.http.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::backend(format!(
                "{} returned {}",
                method,
                response.status()
            )));
        }
        debug!(%method, "Backend notified");
        Ok(())
    }

    /// Fire-and-forget change notification, including bound automation.
    pub fn notify_change(self: &Arc<Self>, update: SignalUpdate) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = client.report_change(&update).await {
                warn!(signal = %update.name, "Change notification failed: {}", e);
            }
            let value = match serde_json::to_value(update.value) {
                Ok(value) => value,
                Err(_) => return,
            };
            if let Err(e) = client.trigger_actions(&update.name, &value).await {
                warn!(signal = %update.name, "Action trigger failed: {}", e);
            }
        });
    }

    /// Fire-and-forget log forwarding.
    pub fn notify_event(self: &Arc<Self>, entry: EventLogEntry) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = client.log_event(&entry).await {
                warn!("Event log forwarding failed: {}", e);
            }
        });
    }
}
