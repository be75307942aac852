//! HTTP surface: snapshot, write, stream, and status endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::catalog::SignalValue;
use crate::error::{BridgeError, Result};
use crate::events::{Event, EventPayload};

#[derive(Clone)]
pub struct AppState {
    bridge: Arc<Bridge>,
}

/// Build the bridge's HTTP router.
pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/signals", get(signals))
        .route("/write_signal", post(write_signal))
        .route("/events", get(events))
        .route("/events/history", get(events_history))
        .route("/status", get(status))
        .route("/reload", post(reload))
        .with_state(AppState { bridge })
}

/// Bind and serve until the shutdown flag flips.
pub async fn serve(bridge: Arc<Bridge>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!(
        "{}:{}",
        bridge.config().listen_host,
        bridge.config().listen_port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "HTTP surface listening");

    let app = router(bridge);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD)
}

async fn signals(State(state): State<AppState>) -> Response {
    Json(state.bridge.snapshot().await).into_response()
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    #[serde(alias = "signal_id")]
    name: String,
    value: SignalValue,
}

#[derive(Debug, Serialize)]
struct WriteResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<SignalValue>,
}

async fn write_signal(
    State(state): State<AppState>,
    Json(request): Json<WriteRequest>,
) -> Response {
    match state.bridge.write_signal(&request.name, request.value).await {
        Ok(accepted) => Json(WriteResponse {
            success: true,
            message: format!("wrote {}", request.name),
            value: Some(accepted),
        })
        .into_response(),
        Err(e) => {
            warn!(signal = %request.name, "Write rejected: {}", e);
            let code = match &e {
                BridgeError::UnknownSignal(_) => StatusCode::NOT_FOUND,
                BridgeError::Write(_) => StatusCode::BAD_REQUEST,
                BridgeError::NotReady(_) | BridgeError::Connection(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                code,
                Json(WriteResponse {
                    success: false,
                    message: e.to_string(),
                    value: None,
                }),
            )
                .into_response()
        }
    }
}

fn to_sse(event: &Event) -> SseEvent {
    let sse = SseEvent::default()
        .event(event.kind.as_str())
        .id(event.id.to_string());
    match serde_json::to_string(&event.data) {
        Ok(json) => sse.data(json),
        Err(e) => SseEvent::default()
            .event("error")
            .data(format!(r#"{{"message":"serialization failed: {}"}}"#, e)),
    }
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let (subscriber_id, rx) = state.bridge.publisher().subscribe();

    // Acknowledge the subscription with the current connection status, so a
    // fresh client renders state before the first poll-driven update.
    let ack = state
        .bridge
        .publisher()
        .make_event(EventPayload::StatusUpdate(
            state.bridge.connection_status().await,
        ));
    info!(subscriber = subscriber_id, "Event stream opened");

    let stream = stream::once(async move { Ok(to_sse(&ack)) })
        .chain(ReceiverStream::new(rx).map(|event| Ok(to_sse(&event))));
    Sse::new(stream)
}

async fn events_history(State(state): State<AppState>) -> Response {
    // Most recent first.
    let mut events = state.bridge.publisher().history_snapshot();
    events.reverse();
    Json(events).into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    Json(state.bridge.connection_status().await).into_response()
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    success: bool,
    message: String,
}

async fn reload(State(state): State<AppState>) -> Response {
    match state.bridge.load_catalog().await {
        Ok(count) => Json(ReloadResponse {
            success: true,
            message: format!("{} signals loaded", count),
        })
        .into_response(),
        Err(e) => {
            warn!("Catalog reload failed: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(ReloadResponse {
                    success: false,
                    message: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

const DASHBOARD: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>PLC Bridge</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 2rem; background: #fafafa; }
  h1 { font-size: 1.3rem; }
  table { border-collapse: collapse; width: 100%; background: #fff; }
  th, td { border: 1px solid #ddd; padding: 0.4rem 0.7rem; text-align: left; }
  th { background: #f0f0f0; }
  .stale { color: #999; }
  #status { margin-bottom: 1rem; }
  .up { color: #2a7d2a; } .down { color: #b03030; }
</style>
</head>
<body>
<h1>PLC Bridge</h1>
<div id="status">connecting…</div>
<table>
  <thead><tr><th>Signal</th><th>Name</th><th>Kind</th><th>Connection</th><th>Value</th></tr></thead>
  <tbody id="rows"></tbody>
</table>
<script>
async function refresh() {
  const res = await fetch('/signals');
  const signals = await res.json();
  const rows = document.getElementById('rows');
  rows.innerHTML = '';
  for (const s of signals) {
    const tr = document.createElement('tr');
    const value = s.value === null ? '<span class="stale">unknown</span>' : s.value;
    tr.innerHTML = `<td>${s.name}</td><td>${s.signal_name}</td><td>${s.signal_type}</td>` +
      `<td>${s.connection}</td><td>${value}</td>`;
    rows.appendChild(tr);
  }
}
const source = new EventSource('/events');
source.addEventListener('status_update', (e) => {
  const status = JSON.parse(e.data);
  const el = document.getElementById('status');
  el.innerHTML = status.connected
    ? '<span class="up">connected</span>'
    : '<span class="down">disconnected</span>';
});
source.addEventListener('signal_update', refresh);
source.addEventListener('signal_updates_batch', refresh);
refresh();
setInterval(refresh, 5000);
</script>
</body>
</html>
"#;
