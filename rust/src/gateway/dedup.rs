use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use ahash::AHashSet;
use tokio::time::Instant;

/// Sliding window of recently seen message ids.
///
/// Tracks ids in insertion order so the oldest can be evicted when the window
/// is full (size-based) or through `cleanup` (age-based).
pub struct DedupWindow {
    ids: AHashSet<String>,
    arrivals: VecDeque<(String, Instant)>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: AHashSet::with_capacity(capacity),
            arrivals: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns true if `id` was seen before; otherwise records it.
    pub fn is_duplicate(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return true;
        }

        if self.ids.len() >= self.capacity
            && let Some((oldest_id, _)) = self.arrivals.pop_front()
        {
            self.ids.remove(&oldest_id);
        }

        let owned = id.to_owned();
        self.ids.insert(owned.clone());
        self.arrivals.push_back((owned, Instant::now()));
        false
    }

    /// Remove all entries older than `max_age`.
    pub fn cleanup(&mut self, max_age: Duration) {
        let now = Instant::now();
        while let Some((id, timestamp)) = self.arrivals.front() {
            if now.duration_since(*timestamp) > max_age {
                let id = id.clone();
                self.arrivals.pop_front();
                self.ids.remove(&id);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Bounded map of finished keys to their outcome, evicting the oldest insert.
pub struct OutcomeCache<V> {
    entries: HashMap<String, V>,
    order: VecDeque<String>,
    capacity: usize,
}

impl<V: Clone> OutcomeCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).cloned()
    }

    pub fn insert(&mut self, key: String, value: V) {
        if self.entries.insert(key.clone(), value).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
