//! Last-known-value store.
//!
//! The single source of truth for "has this signal changed". Pure in-memory;
//! nothing is persisted.

use std::collections::HashMap;

use crate::catalog::SignalValue;

/// A cached reading: value plus epoch-seconds timestamp of the last
/// successful read or accepted write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedValue {
    pub value: SignalValue,
    pub timestamp: f64,
}

/// In-memory map of signal id -> last known value.
#[derive(Debug, Default)]
pub struct ChangeCache {
    entries: HashMap<String, CachedValue>,
}

impl ChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known value for a signal, if any.
    pub fn get(&self, signal_id: &str) -> Option<&CachedValue> {
        self.entries.get(signal_id)
    }

    /// Record a reading.
    pub fn set(&mut self, signal_id: &str, value: SignalValue, timestamp: f64) {
        self.entries.insert(
            signal_id.to_string(),
            CachedValue { value, timestamp },
        );
    }

    /// Whether a fresh reading differs from the cached one.
    ///
    /// An absent entry counts as a change, as does a type mismatch between
    /// the cached and fresh value.
    pub fn is_change(&self, signal_id: &str, fresh: &SignalValue) -> bool {
        match self.entries.get(signal_id) {
            Some(cached) => !cached.value.same_as(fresh),
            None => true,
        }
    }

    /// Drop every entry. Used when the catalog is replaced wholesale, so the
    /// next cycle republishes current values for the new signal set.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_entry_is_a_change() {
        let cache = ChangeCache::new();
        assert!(cache.is_change("S1", &SignalValue::Bool(false)));
    }

    #[test]
    fn test_equal_value_is_not_a_change() {
        let mut cache = ChangeCache::new();
        cache.set("S1", SignalValue::Number(42.0), 1.0);
        assert!(!cache.is_change("S1", &SignalValue::Number(42.0)));
        assert!(cache.is_change("S1", &SignalValue::Number(99.0)));
    }

    #[test]
    fn test_type_mismatch_is_a_change() {
        let mut cache = ChangeCache::new();
        cache.set("S1", SignalValue::Number(1.0), 1.0);
        assert!(cache.is_change("S1", &SignalValue::Bool(true)));
    }

    #[test]
    fn test_set_updates_timestamp() {
        let mut cache = ChangeCache::new();
        cache.set("S1", SignalValue::Bool(true), 10.0);
        cache.set("S1", SignalValue::Bool(true), 20.0);
        assert_eq!(cache.get("S1").unwrap().timestamp, 20.0);
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut cache = ChangeCache::new();
        cache.set("S1", SignalValue::Bool(true), 10.0);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.is_change("S1", &SignalValue::Bool(true)));
    }
}
