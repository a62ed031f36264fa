//! Injected, thread-safe key-value stores.
//!
//! Replay sessions and monitor watch entries live in a `Store` handed to the
//! component at construction. Cloning a `Store` shares the same map; building
//! a new one gives an isolated instance (what tests do).
//!
//! `DashMap` shards its locks, so unrelated keys never serialize on each other.
//! Per-entry mutable state is wrapped in its own lock by the caller.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

/// Shared map handle.
#[derive(Debug)]
pub struct Store<K: Eq + Hash, V> {
    map: Arc<DashMap<K, V>>,
}

impl<K: Eq + Hash, V> Store<K, V> {
    pub fn new() -> Self {
        Self {
            map: Arc::new(DashMap::new()),
        }
    }

    /// Insert, returning the previous value for the key.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Store<K, V> {
    /// Clone of the value for `key`. The shard lock is released on return.
    pub fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|e| e.value().clone())
    }

    /// Snapshot of every entry, in no particular order.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }
}

impl<K: Eq + Hash, V> Default for Store<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            map: Arc::clone(&self.map),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let a: Store<String, u32> = Store::new();
        let b = a.clone();
        a.insert("x".into(), 1);
        assert_eq!(b.get(&"x".to_string()), Some(1));
        assert_eq!(b.keys(), vec!["x".to_string()]);
    }

    #[test]
    fn test_new_instances_are_isolated() {
        let a: Store<String, u32> = Store::new();
        let b: Store<String, u32> = Store::new();
        a.insert("x".into(), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn test_insert_get_remove() {
        let s: Store<u32, &str> = Store::new();
        assert_eq!(s.insert(1, "one"), None);
        assert_eq!(s.insert(1, "uno"), Some("one"));
        assert_eq!(s.get(&1), Some("uno"));
        assert_eq!(s.remove(&1), Some("uno"));
        assert_eq!(s.get(&1), None);
        assert_eq!(s.remove(&1), None);
        assert!(s.is_empty());
    }
}
