use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Track-keyed cache shared between the queue and whoever else holds the `Arc`.
pub trait Cache<V>: Send + Sync {
    fn get(&self, track_id: &str) -> Option<V>;
    fn set(&self, track_id: &str, value: V);
    fn has(&self, track_id: &str) -> bool;
}

/// Process-lifetime in-memory cache. Entries never expire.
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<String, V>>,
}

impl<V> MemoryCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send> Cache<V> for MemoryCache<V> {
    fn get(&self, track_id: &str) -> Option<V> {
        let map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(track_id).cloned()
    }

    fn set(&self, track_id: &str, value: V) {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(track_id.to_string(), value);
    }

    fn has(&self, track_id: &str) -> bool {
        let map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        map.contains_key(track_id)
    }
}
