//! Keyed TTL fallback cache.
//!
//! Mirrors successful query and save results so they can be served when the
//! network fails outright. Never consulted while the store is reachable:
//! the cache is a fallback, not a source of truth.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Default entry lifetime: one hour.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// String-keyed store of serialized results with per-entry TTL.
#[derive(Default)]
pub struct FallbackCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl FallbackCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            CacheEntry { value, expires_at: Instant::now() + ttl },
        );
    }

    /// Fetch an entry. With `ignore_expiry` the entry is returned even past
    /// its TTL, which is what failure-path callers want: stale data beats
    /// no data when the network is down.
    pub fn get(&self, key: &str, ignore_expiry: bool) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;
        if !ignore_expiry && entry.expires_at < Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    /// Cache key for tour-scoped data.
    pub fn tour_key(tour_id: &str, kind: &str) -> String {
        format!("{}:{}", tour_id, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_ttl() {
        let cache = FallbackCache::new();
        cache.put("k", "v".to_string(), Duration::from_millis(10));
        assert_eq!(cache.get("k", false).as_deref(), Some("v"));

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get("k", false), None);
        // Expired entries stay reachable for failure-path callers
        assert_eq!(cache.get("k", true).as_deref(), Some("v"));
    }

    #[test]
    fn remove_and_clear() {
        let cache = FallbackCache::new();
        cache.put("a", "1".to_string(), DEFAULT_TTL);
        cache.put("b", "2".to_string(), DEFAULT_TTL);

        cache.remove("a");
        assert_eq!(cache.get("a", true), None);
        assert_eq!(cache.get("b", false).as_deref(), Some("2"));

        cache.clear();
        assert_eq!(cache.get("b", true), None);
    }

    #[test]
    fn tour_key_format() {
        assert_eq!(FallbackCache::tour_key("tour-1", "crew"), "tour-1:crew");
    }
}
