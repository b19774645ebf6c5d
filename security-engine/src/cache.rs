//! Shared key-value cache
//!
//! Token blacklists, usage counters, MFA codes and lockout-adjacent state must
//! be consistent across every process instance, so components talk to a
//! [`KeyValueCache`] rather than holding that state locally. [`MemoryCache`]
//! is the single-process implementation; a networked store implements the
//! same trait.

use crate::clock::{self, Clock};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Shared cache seam
pub trait KeyValueCache: Send + Sync {
    /// Fetch a live value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with a TTL, overwriting any previous value
    fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Store only if absent. Returns `true` when the value was written.
    fn add(&self, key: &str, value: String, ttl: Duration) -> Result<bool>;

    /// Remove a key. Returns `true` when a live value was removed.
    fn forget(&self, key: &str) -> Result<bool>;

    /// Atomically increment a counter, creating it with `ttl` on first use
    fn increment(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Check for a live value
    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

impl dyn KeyValueCache {
    /// Fetch and deserialize a JSON value
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Serialize and store a JSON value
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.put(key, raw, ttl)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process cache backed by `DashMap` with lazy expiry
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    /// Create a cache on the wall clock
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    /// Create a cache on an injected clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop expired entries
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    /// Number of stored entries, including not yet purged expired ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expiry(&self, ttl: Duration) -> Result<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Storage(format!("TTL out of range: {}", e)))?;
        Ok(self.clock.now() + ttl)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry(ttl)?;
        self.entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    fn add(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl)?;
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(false);
                }
                occupied.insert(CacheEntry { value, expires_at });
                Ok(true)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(CacheEntry { value, expires_at });
                Ok(true)
            }
        }
    }

    fn forget(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| entry.expires_at > now)
            .unwrap_or(false))
    }

    fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl)?;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                value: "0".to_string(),
                expires_at,
            });

        if entry.expires_at <= now {
            *entry = CacheEntry {
                value: "0".to_string(),
                expires_at,
            };
        }

        let current: u64 = entry
            .value
            .parse()
            .map_err(|_| Error::Storage(format!("Cache value at {} is not a counter", key)))?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache() -> (Arc<ManualClock>, MemoryCache) {
        let clock = ManualClock::starting_now();
        let cache = MemoryCache::with_clock(clock.clone());
        (clock, cache)
    }

    #[test]
    fn test_put_get_expire() {
        let (clock, cache) = cache();
        cache
            .put("k", "v".to_string(), Duration::from_secs(60))
            .unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_add_only_if_absent() {
        let (clock, cache) = cache();
        assert!(cache.add("k", "a".into(), Duration::from_secs(5)).unwrap());
        assert!(!cache.add("k", "b".into(), Duration::from_secs(5)).unwrap());
        clock.advance(chrono::Duration::seconds(6));
        assert!(cache.add("k", "c".into(), Duration::from_secs(5)).unwrap());
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("c"));
    }

    #[test]
    fn test_increment_keeps_first_ttl() {
        let (clock, cache) = cache();
        let ttl = Duration::from_secs(10);
        assert_eq!(cache.increment("n", ttl).unwrap(), 1);
        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(cache.increment("n", ttl).unwrap(), 2);
        clock.advance(chrono::Duration::seconds(5));
        // first TTL elapsed, counter restarts
        assert_eq!(cache.increment("n", ttl).unwrap(), 1);
    }

    #[test]
    fn test_json_helpers() {
        let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
        cache
            .put_json("list", &vec![1u32, 2, 3], Duration::from_secs(30))
            .unwrap();
        let back: Option<Vec<u32>> = cache.get_json("list").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        assert!(cache.forget("list").unwrap());
        assert!(!cache.has("list").unwrap());
    }
}
