use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const VILLAGE_TTL: Duration = Duration::from_secs(60);
pub const NEIGHBOR_TTL: Duration = Duration::from_secs(120);
pub const STATS_TTL: Duration = Duration::from_secs(300);

struct CacheEntry<V> {
    stored_at: Instant,
    value: V,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    // longest ttl any reader asked for; older entries are dead for everyone
    retention: Duration,
}

/// TTL memoization for read-mostly queries. Entries are never invalidated
/// by writes; readers accept staleness up to the TTL they pass in.
pub struct QueryCache<V> {
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> Default for QueryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> QueryCache<V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                retention: Duration::ZERO,
            }),
        }
    }

    pub fn get(&self, key: &str, ttl: Duration) -> Option<V> {
        self.get_at(key, ttl, Instant::now())
    }

    fn get_at(&self, key: &str, ttl: Duration, now: Instant) -> Option<V> {
        let mut state = self.state.lock();
        state.retention = state.retention.max(ttl);
        let entry = state.entries.get(key)?;
        if now.saturating_duration_since(entry.stored_at) < ttl {
            return Some(entry.value.clone());
        }
        if now.saturating_duration_since(entry.stored_at) >= state.retention {
            state.entries.remove(key);
        }
        None
    }

    /// Stores `value` and drops entries no reader can still accept.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_at(key.into(), value, Instant::now());
    }

    fn insert_at(&self, key: String, value: V, stored_at: Instant) {
        let mut state = self.state.lock();
        let retention = state.retention;
        if !retention.is_zero() {
            state
                .entries
                .retain(|_, entry| stored_at.saturating_duration_since(entry.stored_at) < retention);
        }
        state.entries.insert(key, CacheEntry { stored_at, value });
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
