//! Concurrent map whose entries expire after an idle window.
//!
//! Entries carry the time of their last access. An entry that has been idle
//! longer than the window is never returned by [`ExpiringMap::get`]: it is
//! evicted on the spot. [`ExpiringMap::sweep`] evicts everything idle in one
//! pass. Both paths remove the entry first and then run the eviction hook,
//! so the hook may freely touch other maps (or this one) without deadlocking
//! on a shard lock.

use crate::clock::Instant;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::time::Duration;

/// Callback run after an entry leaves the map through expiry or invalidation.
pub type EvictionHook<K, V> = Box<dyn Fn(K, V) + Send + Sync>;

struct Slot<V> {
    value: V,
    last_access: Instant,
}

impl<V> Slot<V> {
    fn new(value: V) -> Self {
        Self {
            value,
            last_access: Instant::now(),
        }
    }

    fn is_expired(&self, idle: Duration, now: Instant) -> bool {
        now.duration_since(self.last_access) > idle
    }
}

pub struct ExpiringMap<K, V> {
    entries: DashMap<K, Slot<V>>,
    idle: Duration,
    on_evict: Option<EvictionHook<K, V>>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(idle: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle,
            on_evict: None,
        }
    }

    /// Create a map that runs `hook` for every expired or invalidated entry.
    pub fn with_eviction_hook<F>(idle: Duration, hook: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        Self {
            entries: DashMap::new(),
            idle,
            on_evict: Some(Box::new(hook)),
        }
    }

    /// Insert or replace an entry with a fresh timestamp.
    ///
    /// A replaced value is returned without running the hook.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries
            .insert(key, Slot::new(value))
            .map(|slot| slot.value)
    }

    /// Insert only if no entry (live or expired) holds `key`.
    pub fn insert_if_vacant(&self, key: K, value: V) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value));
                true
            }
        }
    }

    /// Return a live entry and refresh its idle clock.
    ///
    /// An expired entry is evicted (running the hook) and `None` returned.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let mut slot = self.entries.get_mut(key)?;
            if !slot.is_expired(self.idle, now) {
                slot.last_access = now;
                return Some(slot.value.clone());
            }
        }
        self.evict_if_expired(key, now);
        None
    }

    /// Read an entry without refreshing it and without checking expiry.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|slot| slot.value.clone())
    }

    /// Refresh a live entry's idle clock.
    ///
    /// Returns false if the entry is absent or already expired. An expired
    /// entry is left in place and nothing is evicted, so this is safe to call
    /// while holding a lock the eviction hook takes.
    pub fn touch(&self, key: &K) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut slot) if !slot.is_expired(self.idle, now) => {
                slot.last_access = now;
                true
            }
            _ => false,
        }
    }

    /// Remove an entry without running the hook.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, slot)| slot.value)
    }

    /// Remove the entry at `key` if its value matches `predicate`, then run
    /// the hook for it. Returns whether an entry was removed.
    pub fn invalidate_if<P>(&self, key: &K, predicate: P) -> bool
    where
        P: FnOnce(&V) -> bool,
    {
        match self.entries.remove_if(key, |_, slot| predicate(&slot.value)) {
            Some((key, slot)) => {
                self.run_hook(key, slot.value);
                true
            }
            None => false,
        }
    }

    /// Evict every idle entry. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(self.idle, now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .iter()
            .filter(|key| self.evict_if_expired(key, now))
            .count()
    }

    /// Remove every entry without running the hook and hand them back.
    pub fn drain(&self) -> Vec<(K, V)> {
        let keys: Vec<K> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|(key, slot)| (key, slot.value))
            .collect()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Re-checks expiry under the shard lock: the entry may have been
    // refreshed since the caller looked at it.
    fn evict_if_expired(&self, key: &K, now: Instant) -> bool {
        let idle = self.idle;
        match self
            .entries
            .remove_if(key, |_, slot| slot.is_expired(idle, now))
        {
            Some((key, slot)) => {
                self.run_hook(key, slot.value);
                true
            }
            None => false,
        }
    }

    fn run_hook(&self, key: K, value: V) {
        if let Some(ref hook) = self.on_evict {
            hook(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::{Arc, Mutex};

    fn recording_map(idle: Duration) -> (ExpiringMap<u16, &'static str>, Arc<Mutex<Vec<u16>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = evicted.clone();
        let map = ExpiringMap::with_eviction_hook(idle, move |key, _| {
            log.lock().unwrap().push(key);
        });
        (map, evicted)
    }

    #[test]
    fn test_get_refreshes_idle_clock() {
        MockClock::set_time(Duration::ZERO);
        let (map, evicted) = recording_map(Duration::from_secs(10));
        map.insert(1, "a");

        MockClock::advance(Duration::from_secs(8));
        assert_eq!(map.get(&1), Some("a"));
        MockClock::advance(Duration::from_secs(8));
        assert_eq!(map.get(&1), Some("a"));
        assert!(evicted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_lazy_eviction_runs_hook() {
        MockClock::set_time(Duration::ZERO);
        let (map, evicted) = recording_map(Duration::from_secs(10));
        map.insert(7, "x");

        MockClock::advance(Duration::from_secs(11));
        assert_eq!(map.get(&7), None);
        assert!(!map.contains_key(&7));
        assert_eq!(*evicted.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_sweep_only_evicts_idle() {
        MockClock::set_time(Duration::ZERO);
        let (map, evicted) = recording_map(Duration::from_secs(10));
        map.insert(1, "old");
        MockClock::advance(Duration::from_secs(6));
        map.insert(2, "new");
        MockClock::advance(Duration::from_secs(6));

        assert_eq!(map.sweep(), 1);
        assert_eq!(map.len(), 1);
        assert_eq!(map.peek(&2), Some("new"));
        assert_eq!(*evicted.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_peek_does_not_refresh() {
        MockClock::set_time(Duration::ZERO);
        let (map, _) = recording_map(Duration::from_secs(10));
        map.insert(1, "a");
        MockClock::advance(Duration::from_secs(9));
        assert_eq!(map.peek(&1), Some("a"));
        MockClock::advance(Duration::from_secs(2));
        assert_eq!(map.sweep(), 1);
    }

    #[test]
    fn test_remove_skips_hook_invalidate_if_runs_it() {
        let (map, evicted) = recording_map(Duration::from_secs(10));
        map.insert(1, "a");
        map.insert(2, "b");

        assert_eq!(map.remove(&1), Some("a"));
        assert!(map.invalidate_if(&2, |_| true));
        assert!(!map.invalidate_if(&2, |_| true));
        assert_eq!(*evicted.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_insert_if_vacant() {
        let map: ExpiringMap<u16, u8> = ExpiringMap::new(Duration::from_secs(1));
        assert!(map.insert_if_vacant(5, 1));
        assert!(!map.insert_if_vacant(5, 2));
        assert_eq!(map.peek(&5), Some(1));
    }

    #[test]
    fn test_invalidate_if_checks_value() {
        let (map, evicted) = recording_map(Duration::from_secs(10));
        map.insert(1, "odd");
        map.insert(2, "even");

        assert!(!map.invalidate_if(&1, |v| *v == "even"));
        assert!(map.invalidate_if(&2, |v| *v == "even"));
        assert!(!map.invalidate_if(&3, |_| true));
        assert_eq!(map.len(), 1);
        assert_eq!(*evicted.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_hook_may_reenter_map() {
        MockClock::set_time(Duration::ZERO);
        let map: Arc<ExpiringMap<u16, u16>> = Arc::new_cyclic(|weak: &std::sync::Weak<ExpiringMap<u16, u16>>| {
            let weak = weak.clone();
            ExpiringMap::with_eviction_hook(Duration::from_secs(1), move |_, partner| {
                if let Some(map) = weak.upgrade() {
                    map.remove(&partner);
                }
            })
        });
        map.insert(1, 2);
        map.insert(2, 1);
        MockClock::advance(Duration::from_secs(2));
        map.touch(&2);
        assert_eq!(map.get(&1), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_touch_refuses_expired_entry() {
        MockClock::set_time(Duration::ZERO);
        let (map, evicted) = recording_map(Duration::from_secs(10));
        map.insert(1, "a");

        MockClock::advance(Duration::from_secs(8));
        assert!(map.touch(&1));
        MockClock::advance(Duration::from_secs(8));
        assert_eq!(map.peek(&1), Some("a"));

        MockClock::advance(Duration::from_secs(3));
        assert!(!map.touch(&1));
        assert!(!map.touch(&2));
        // Left for the sweep, hook not run yet
        assert!(map.contains_key(&1));
        assert!(evicted.lock().unwrap().is_empty());
        assert_eq!(map.sweep(), 1);
    }

    #[test]
    fn test_drain() {
        let (map, evicted) = recording_map(Duration::from_secs(10));
        map.insert(1, "a");
        map.insert(2, "b");
        let mut drained = map.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![(1, "a"), (2, "b")]);
        assert!(map.is_empty());
        assert!(evicted.lock().unwrap().is_empty());
    }
}
