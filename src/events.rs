//! Event model and the bounded event history.
//!
//! Event kinds and payload shapes match what existing stream subscribers
//! already consume: `signal_update`, `signal_updates_batch`, `status_update`,
//! `event_log`, `heartbeat`, `error`.

use std::collections::VecDeque;

use serde::Serialize;

use crate::catalog::SignalValue;

/// History ring capacity; oldest events are evicted past this.
pub const HISTORY_CAPACITY: usize = 100;

/// Current time as epoch seconds (the wire format subscribers expect).
pub fn epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// One signal-value change as delivered to subscribers and the backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SignalUpdate {
    /// Signal id.
    pub name: String,
    /// Display name.
    pub signal_name: String,
    pub value: SignalValue,
    /// Epoch seconds.
    pub timestamp: f64,
    /// "plc_bridge" for polled changes, "write_request" for operator writes.
    pub source: &'static str,
}

/// Per-connection status as seen by subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectionStatus {
    pub name: String,
    pub connected: bool,
    pub last_error: Option<String>,
}

/// Aggregate connection status.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusUpdate {
    /// True when any connection is up.
    pub connected: bool,
    pub connections: Vec<ConnectionStatus>,
    pub timestamp: f64,
}

impl StatusUpdate {
    /// Same connection state as another update, ignoring the timestamp.
    pub fn same_state(&self, other: &StatusUpdate) -> bool {
        self.connected == other.connected && self.connections == other.connections
    }
}

/// An operational log entry worth telling subscribers and the backend about.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventLogEntry {
    pub event_type: String,
    /// "Success" or "Failed".
    pub status: String,
    pub message: String,
    pub timestamp: f64,
}

/// Event categories, one per wire event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SignalUpdate,
    SignalUpdatesBatch,
    StatusUpdate,
    EventLog,
    Heartbeat,
    Error,
}

impl EventKind {
    /// Wire name, used as the SSE event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SignalUpdate => "signal_update",
            EventKind::SignalUpdatesBatch => "signal_updates_batch",
            EventKind::StatusUpdate => "status_update",
            EventKind::EventLog => "event_log",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Error => "error",
        }
    }
}

/// Typed event payload; serialized untagged so each payload keeps the shape
/// subscribers already parse.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EventPayload {
    SignalUpdate(SignalUpdate),
    SignalUpdatesBatch { updates: Vec<SignalUpdate> },
    StatusUpdate(StatusUpdate),
    EventLog(EventLogEntry),
    Heartbeat { timestamp: f64 },
    Error { message: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SignalUpdate(_) => EventKind::SignalUpdate,
            EventPayload::SignalUpdatesBatch { .. } => EventKind::SignalUpdatesBatch,
            EventPayload::StatusUpdate(_) => EventKind::StatusUpdate,
            EventPayload::EventLog(_) => EventKind::EventLog,
            EventPayload::Heartbeat { .. } => EventKind::Heartbeat,
            EventPayload::Error { .. } => EventKind::Error,
        }
    }
}

/// An immutable published event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    pub id: u64,
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub data: EventPayload,
    pub timestamp: f64,
}

impl Event {
    pub fn new(id: u64, data: EventPayload) -> Self {
        Self {
            id,
            kind: data.kind(),
            data,
            timestamp: epoch_secs(),
        }
    }
}

/// Bounded, oldest-first event log for `/events/history`.
#[derive(Debug)]
pub struct EventHistory {
    ring: VecDeque<Event>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an event, evicting the oldest past capacity.
    pub fn push(&mut self, event: Event) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(event);
    }

    /// Oldest-first snapshot.
    pub fn snapshot(&self) -> Vec<Event> {
        self.ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(name: &str, value: f64) -> SignalUpdate {
        SignalUpdate {
            name: name.to_string(),
            signal_name: name.to_string(),
            value: SignalValue::Number(value),
            timestamp: 1000.0,
            source: "plc_bridge",
        }
    }

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(EventKind::SignalUpdate.as_str(), "signal_update");
        assert_eq!(EventKind::SignalUpdatesBatch.as_str(), "signal_updates_batch");
        assert_eq!(EventKind::Heartbeat.as_str(), "heartbeat");
    }

    #[test]
    fn test_signal_update_serialization() {
        let event = Event::new(7, EventPayload::SignalUpdate(update("S1", 42.0)));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["event"], "signal_update");
        assert_eq!(json["data"]["name"], "S1");
        assert_eq!(json["data"]["value"], 42.0);
        assert_eq!(json["data"]["source"], "plc_bridge");
    }

    #[test]
    fn test_batch_serialization_has_updates_array() {
        let event = Event::new(
            1,
            EventPayload::SignalUpdatesBatch {
                updates: vec![update("S1", 1.0), update("S2", 2.0)],
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "signal_updates_batch");
        assert_eq!(json["data"]["updates"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = EventHistory::new(3);
        for i in 0..5 {
            history.push(Event::new(i, EventPayload::Heartbeat { timestamp: 0.0 }));
        }
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].id, 2);
        assert_eq!(snapshot[2].id, 4);
    }
}
