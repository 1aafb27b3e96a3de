//! Bounded TTL cache for reformulations and retrieval results.
//!
//! Entries are deterministic functions of their key, so last-writer-wins
//! races are harmless. Eviction is lazy on read plus an oldest-first sweep
//! when the capacity bound is crossed.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone)]
struct Entry {
    value: String,
    inserted_at: Instant,
}

pub struct TtlCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    capacity: usize,
}

impl TtlCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Stable fingerprint for a retrieval request.
    pub fn retrieval_fingerprint(
        mode: &str,
        query: &str,
        collection: Option<uuid::Uuid>,
        filter: Option<&serde_json::Value>,
        top_k: usize,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(mode.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(query.trim().to_lowercase().as_bytes());
        hasher.update(b"\x1f");
        if let Some(collection) = collection {
            hasher.update(collection.as_bytes());
        }
        hasher.update(b"\x1f");
        if let Some(filter) = filter {
            hasher.update(filter.to_string().as_bytes());
        }
        hasher.update(b"\x1f");
        hasher.update(top_k.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn reformulation_key(query: &str, mode: &str) -> String {
        format!("reformulate:{}:{}", mode, query.trim().to_lowercase())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, key: String, value: String) {
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        if self.entries.len() > self.capacity {
            self.evict();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries, then oldest entries until within capacity.
    fn evict(&self) {
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);

        let over = self.entries.len().saturating_sub(self.capacity);
        if over == 0 {
            return;
        }

        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().inserted_at))
            .collect();
        by_age.sort_by_key(|(_, inserted)| *inserted);
        for (key, _) in by_age.into_iter().take(over) {
            self.entries.remove(&key);
        }
        debug!("cache evicted {} entries", over);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_round_trip() {
        let cache = TtlCache::new(Duration::from_secs(60), 10);
        cache.set("k".to_string(), "v".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn expired_entries_vanish() {
        let cache = TtlCache::new(Duration::from_millis(0), 10);
        cache.set("k".to_string(), "v".to_string());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty() || cache.len() <= 1);
    }

    #[test]
    fn capacity_bound_evicts_oldest() {
        let cache = TtlCache::new(Duration::from_secs(60), 3);
        for i in 0..5 {
            cache.set(format!("k{}", i), "v".to_string());
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(cache.len() <= 3);
        // The newest survives
        assert!(cache.get("k4").is_some());
    }

    #[test]
    fn fingerprint_is_stable_and_discriminating() {
        let collection = uuid::Uuid::new_v4();
        let a = TtlCache::retrieval_fingerprint("hybrid", "What Is Raft?", Some(collection), None, 10);
        let b = TtlCache::retrieval_fingerprint("hybrid", "  what is raft?  ", Some(collection), None, 10);
        assert_eq!(a, b, "normalization should make these equal");

        let c = TtlCache::retrieval_fingerprint("semantic", "what is raft?", Some(collection), None, 10);
        assert_ne!(a, c, "mode must discriminate");
        let d = TtlCache::retrieval_fingerprint("hybrid", "what is raft?", Some(collection), None, 20);
        assert_ne!(a, d, "top_k must discriminate");
    }
}
