use std::{
    collections::{HashMap, VecDeque},
    sync::RwLock,
};

/// A size-bounded map that allows concurrent access for readers and writers.
///
/// When full, inserting a new key evicts the oldest inserted key.
pub(crate) struct BoundedCache<V> {
    capacity: usize,
    entries: RwLock<Entries<V>>,
}

struct Entries<V> {
    map: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(Entries {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        // Err() is only possible if a writer panicked while holding the lock. Treat it as a miss
        // rather than crashing the caller.
        let entries = self.entries.read().ok()?;
        entries.map.get(key).cloned()
    }

    pub fn insert(&self, key: String, value: V) {
        self.insert_if(key, value, || true);
    }

    /// Insert only if `condition` holds while the write lock is held. Returns `true` if the value
    /// was inserted.
    pub fn insert_if(&self, key: String, value: V, condition: impl FnOnce() -> bool) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        if !condition() {
            return false;
        }

        if let Some(slot) = entries.map.get_mut(&key) {
            *slot = value;
            return true;
        }

        while entries.map.len() >= self.capacity {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            entries.map.remove(&oldest);
            log::warn!(target: "ff", key = oldest.as_str(), capacity = self.capacity; "cache is full, evicted oldest entry");
        }

        entries.order.push_back(key.clone());
        entries.map.insert(key, value);
        true
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.write().ok()?;
        let value = entries.map.remove(key)?;
        entries.order.retain(|k| k != key);
        Some(value)
    }

    pub fn keys(&self) -> Vec<String> {
        match self.entries.read() {
            Ok(entries) => entries.order.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.map.len()).unwrap_or(0)
    }
}
