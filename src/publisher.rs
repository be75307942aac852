//! Outbound event distribution.
//!
//! Batches and throttles notifications to stream subscribers, and maintains
//! the bounded event history. Delivery is best-effort: each subscriber owns an
//! independent bounded queue, and a subscriber that cannot keep up (or has
//! gone away) is dropped from the set without affecting the others.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{
    Event, EventHistory, EventLogEntry, EventPayload, SignalUpdate, StatusUpdate,
};

/// Minimum interval between published events of one category, and between
/// change events for one specific signal.
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(1);

/// Window after which accumulated signal changes are flushed as one batch.
pub const BATCH_WINDOW: Duration = Duration::from_secs(1);

/// Accumulated signal changes past this count flush immediately.
pub const MAX_BATCH_SIZE: usize = 25;

/// Outbound queue depth per subscriber.
const SUBSCRIBER_QUEUE: usize = 64;

/// Interval between heartbeat events; doubles as the liveness probe.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Rate limiter for one event category.
#[derive(Debug)]
struct Throttle {
    window: Duration,
    last: Option<Instant>,
}

impl Throttle {
    fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Record and allow a publish if the window has elapsed.
    fn allow(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Rate limiter for signal-change events, keyed per signal.
#[derive(Debug)]
struct SignalThrottle {
    window: Duration,
    last: HashMap<String, Instant>,
}

impl SignalThrottle {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    fn allow(&mut self, signal_id: &str, now: Instant) -> bool {
        match self.last.get(signal_id) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.last.insert(signal_id.to_string(), now);
                true
            }
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

struct PublisherState {
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    next_event_id: u64,
    history: EventHistory,
    signal_throttle: SignalThrottle,
    status_throttle: Throttle,
    event_log_throttle: Throttle,
    pending: Vec<SignalUpdate>,
    last_status: Option<StatusUpdate>,
}

impl PublisherState {
    fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// Deliver an event to every subscriber, dropping those that fail.
    fn deliver(&mut self, event: &Event) {
        self.subscribers.retain(|sub| {
            if sub.tx.try_send(event.clone()).is_ok() {
                true
            } else {
                warn!(subscriber = sub.id, "Dropping subscriber (queue full or closed)");
                false
            }
        });
    }
}

/// Batched, throttled publish-subscribe fan-out to stream subscribers.
pub struct EventPublisher {
    state: Mutex<PublisherState>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PublisherState {
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                next_event_id: 0,
                history: EventHistory::default(),
                signal_throttle: SignalThrottle::new(THROTTLE_WINDOW),
                status_throttle: Throttle::new(THROTTLE_WINDOW),
                event_log_throttle: Throttle::new(THROTTLE_WINDOW),
                pending: Vec::new(),
                last_status: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PublisherState> {
        // Publisher methods never hold the lock across an await point and
        // never panic while holding it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new stream subscriber, returning its id and event queue.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Event>) {
        let mut state = self.lock();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        state.subscribers.push(Subscriber { id, tx });
        info!(subscriber = id, total = state.subscribers.len(), "Stream subscriber connected");
        (id, rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Build an event with an assigned id without recording or delivering it.
    /// Used for the per-connection acknowledgement on the stream endpoint.
    pub fn make_event(&self, payload: EventPayload) -> Event {
        let mut state = self.lock();
        let id = state.next_event_id();
        Event::new(id, payload)
    }

    /// Publish a signal-value change.
    ///
    /// Every attempt lands in the history. Unless `immediate` is set (operator
    /// writes), the per-signal throttle applies and surviving changes are
    /// accumulated for the next batch flush.
    pub fn publish_signal_change(&self, update: SignalUpdate, immediate: bool) {
        let now = Instant::now();
        let mut state = self.lock();

        let id = state.next_event_id();
        let event = Event::new(id, EventPayload::SignalUpdate(update.clone()));
        state.history.push(event.clone());

        if immediate {
            state.signal_throttle.allow(&update.name, now);
            // A queued change for this signal is older than the value being
            // delivered now; flushing it later would hand subscribers a
            // stale last-seen value.
            state.pending.retain(|pending| pending.name != update.name);
            state.deliver(&event);
            return;
        }

        if !state.signal_throttle.allow(&update.name, now) {
            debug!(signal = %update.name, "Throttled signal change");
            return;
        }

        state.pending.push(update);
        if state.pending.len() >= MAX_BATCH_SIZE {
            Self::flush_locked(&mut state);
        }
    }

    /// Publish a connection status update.
    ///
    /// An update whose state (timestamp aside) matches the last published one
    /// is dropped outright, so a quiet poll loop neither chatters at
    /// subscribers nor floods the signal-change audit out of the history
    /// ring. Changed states are recorded and delivered under the category
    /// throttle.
    pub fn publish_status(&self, status: StatusUpdate) {
        let now = Instant::now();
        let mut state = self.lock();
        if state
            .last_status
            .as_ref()
            .is_some_and(|previous| previous.same_state(&status))
        {
            return;
        }
        state.last_status = Some(status.clone());
        let id = state.next_event_id();
        let event = Event::new(id, EventPayload::StatusUpdate(status));
        state.history.push(event.clone());
        if state.status_throttle.allow(now) {
            state.deliver(&event);
        }
    }

    /// Publish an operational log entry. Throttled per category.
    pub fn publish_event_log(&self, entry: EventLogEntry) {
        let now = Instant::now();
        let mut state = self.lock();
        let id = state.next_event_id();
        let event = Event::new(id, EventPayload::EventLog(entry));
        state.history.push(event.clone());
        if state.event_log_throttle.allow(now) {
            state.deliver(&event);
        }
    }

    /// Publish an error notice to subscribers.
    pub fn publish_error(&self, message: impl Into<String>) {
        let mut state = self.lock();
        let id = state.next_event_id();
        let event = Event::new(
            id,
            EventPayload::Error {
                message: message.into(),
            },
        );
        state.history.push(event.clone());
        state.deliver(&event);
    }

    /// Flush accumulated signal changes.
    ///
    /// A single pending change goes out as a plain `signal_update`; more than
    /// one as a `signal_updates_batch` (existing subscribers parse both). With
    /// no subscribers connected the batch is discarded rather than grown.
    pub fn flush_pending(&self) {
        let mut state = self.lock();
        Self::flush_locked(&mut state);
    }

    fn flush_locked(state: &mut PublisherState) {
        if state.pending.is_empty() {
            return;
        }
        let mut updates = std::mem::take(&mut state.pending);
        if state.subscribers.is_empty() {
            debug!(discarded = updates.len(), "No subscribers, discarding batch");
            return;
        }

        let id = state.next_event_id();
        let event = if updates.len() == 1 {
            Event::new(id, EventPayload::SignalUpdate(updates.remove(0)))
        } else {
            Event::new(id, EventPayload::SignalUpdatesBatch { updates })
        };
        state.deliver(&event);
    }

    /// Send a heartbeat to every subscriber.
    ///
    /// Heartbeats are a liveness probe, not an audit record: they prune dead
    /// subscribers but are not appended to the history.
    pub fn heartbeat(&self) {
        let mut state = self.lock();
        let id = state.next_event_id();
        let event = Event::new(
            id,
            EventPayload::Heartbeat {
                timestamp: crate::events::epoch_secs(),
            },
        );
        state.deliver(&event);
    }

    /// Drop subscribers whose receiving end has gone away.
    pub fn prune_closed(&self) {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        let dropped = before - state.subscribers.len();
        if dropped > 0 {
            info!(dropped, remaining = state.subscribers.len(), "Pruned stale subscribers");
        }
    }

    /// Oldest-first snapshot of the event history.
    pub fn history_snapshot(&self) -> Vec<Event> {
        self.lock().history.snapshot()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SignalValue;
    use crate::events::{ConnectionStatus, EventKind};

    fn update(name: &str, value: f64) -> SignalUpdate {
        SignalUpdate {
            name: name.to_string(),
            signal_name: name.to_string(),
            value: SignalValue::Number(value),
            timestamp: 1000.0,
            source: "plc_bridge",
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_throttle_allows_then_blocks() {
        let mut throttle = Throttle::new(Duration::from_secs(1));
        let now = Instant::now();
        assert!(throttle.allow(now));
        assert!(!throttle.allow(now + Duration::from_millis(100)));
        assert!(throttle.allow(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_signal_throttle_is_per_signal() {
        let mut throttle = SignalThrottle::new(Duration::from_secs(1));
        let now = Instant::now();
        assert!(throttle.allow("S1", now));
        assert!(throttle.allow("S2", now));
        assert!(!throttle.allow("S1", now));
    }

    #[test]
    fn test_flood_yields_at_most_one_delivery_per_window() {
        let publisher = EventPublisher::new();
        let (_, mut rx) = publisher.subscribe();

        for i in 0..100 {
            publisher.publish_signal_change(update("S1", i as f64), false);
        }
        publisher.flush_pending();

        let delivered: Vec<Event> = drain(&mut rx)
            .into_iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    EventKind::SignalUpdate | EventKind::SignalUpdatesBatch
                )
            })
            .collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].kind, EventKind::SignalUpdate);
    }

    #[test]
    fn test_throttled_changes_still_reach_history() {
        let publisher = EventPublisher::new();
        for i in 0..10 {
            publisher.publish_signal_change(update("S1", i as f64), false);
        }
        let history = publisher.history_snapshot();
        assert_eq!(history.len(), 10);
        assert!(history.iter().all(|e| e.kind == EventKind::SignalUpdate));
    }

    #[test]
    fn test_batch_of_many_flushes_as_batch_event() {
        let publisher = EventPublisher::new();
        let (_, mut rx) = publisher.subscribe();

        publisher.publish_signal_change(update("S1", 1.0), false);
        publisher.publish_signal_change(update("S2", 2.0), false);
        publisher.flush_pending();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::SignalUpdatesBatch);
    }

    #[test]
    fn test_immediate_publish_bypasses_batching() {
        let publisher = EventPublisher::new();
        let (_, mut rx) = publisher.subscribe();

        publisher.publish_signal_change(update("S1", 7.0), true);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::SignalUpdate);
    }

    #[test]
    fn test_immediate_publish_supersedes_pending_change_for_same_signal() {
        let publisher = EventPublisher::new();
        let (_, mut rx) = publisher.subscribe();

        publisher.publish_signal_change(update("S1", 1.0), false);
        publisher.publish_signal_change(update("S1", 2.0), true);
        publisher.flush_pending();

        // Only the immediate delivery arrives; the queued 1.0 must not
        // follow it and become the subscriber's last-seen value.
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0].data {
            EventPayload::SignalUpdate(u) => {
                assert_eq!(u.value, SignalValue::Number(2.0));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_immediate_publish_keeps_pending_changes_for_other_signals() {
        let publisher = EventPublisher::new();
        let (_, mut rx) = publisher.subscribe();

        publisher.publish_signal_change(update("S1", 1.0), false);
        publisher.publish_signal_change(update("S2", 2.0), true);
        publisher.flush_pending();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        match &events[1].data {
            EventPayload::SignalUpdate(u) => assert_eq!(u.name, "S1"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_batch_discarded_without_subscribers() {
        let publisher = EventPublisher::new();
        publisher.publish_signal_change(update("S1", 1.0), false);
        publisher.flush_pending();

        // A subscriber connecting afterwards sees nothing from the old batch.
        let (_, mut rx) = publisher.subscribe();
        publisher.flush_pending();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_oversize_batch_flushes_early() {
        let publisher = EventPublisher::new();
        let (_, mut rx) = publisher.subscribe();

        for i in 0..MAX_BATCH_SIZE {
            publisher.publish_signal_change(update(&format!("S{}", i), 1.0), false);
        }

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::SignalUpdatesBatch);
    }

    #[test]
    fn test_dead_subscriber_is_pruned_without_affecting_others() {
        let publisher = EventPublisher::new();
        let (_, rx_dead) = publisher.subscribe();
        let (_, mut rx_live) = publisher.subscribe();
        drop(rx_dead);

        publisher.prune_closed();
        assert_eq!(publisher.subscriber_count(), 1);

        publisher.publish_signal_change(update("S1", 1.0), true);
        assert_eq!(drain(&mut rx_live).len(), 1);
    }

    fn status(connected: bool, timestamp: f64) -> StatusUpdate {
        StatusUpdate {
            connected,
            connections: vec![ConnectionStatus {
                name: "C1".to_string(),
                connected,
                last_error: None,
            }],
            timestamp,
        }
    }

    #[test]
    fn test_unchanged_status_is_published_once() {
        let publisher = EventPublisher::new();
        publisher.publish_signal_change(update("S1", 1.0), true);

        // A quiet poll loop re-reports the same state with fresh timestamps.
        for i in 0..200 {
            publisher.publish_status(status(true, i as f64));
        }

        let history = publisher.history_snapshot();
        assert!(history.iter().any(|e| e.kind == EventKind::SignalUpdate));
        assert_eq!(
            history
                .iter()
                .filter(|e| e.kind == EventKind::StatusUpdate)
                .count(),
            1
        );
    }

    #[test]
    fn test_status_change_is_published_again() {
        let publisher = EventPublisher::new();
        publisher.publish_status(status(true, 1.0));
        publisher.publish_status(status(false, 2.0));

        let recorded = publisher
            .history_snapshot()
            .iter()
            .filter(|e| e.kind == EventKind::StatusUpdate)
            .count();
        assert_eq!(recorded, 2);
    }

    #[test]
    fn test_event_ids_are_monotonic() {
        let publisher = EventPublisher::new();
        let (_, mut rx) = publisher.subscribe();
        publisher.publish_signal_change(update("S1", 1.0), true);
        publisher.heartbeat();
        let events = drain(&mut rx);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
    }
}
