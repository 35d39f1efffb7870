//! Per-session tool cache, keyed by upstream name.
//!
//! Each entry records the upstream's tools and the namespaced-name → original
//! tool name map, and expires after a fixed TTL. Selector-driven calls skip
//! the cache entirely; it exists for listing and namespaced-name resolution.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use relay_upstream::ToolRecord;

pub const TOOL_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CacheEntry {
    fetched_at: Instant,
    pub tools: Vec<ToolRecord>,
    pub original_by_namespaced: HashMap<String, String>,
}

#[derive(Debug)]
pub struct ToolCache {
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl Default for ToolCache {
    fn default() -> Self {
        Self::new(TOOL_CACHE_TTL)
    }
}

impl ToolCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// A fresh entry for `upstream`, if any.
    pub fn get(&self, upstream: &str) -> Option<&CacheEntry> {
        self.entries
            .get(upstream)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
    }

    pub fn insert(
        &mut self,
        upstream: &str,
        tools: Vec<ToolRecord>,
        original_by_namespaced: HashMap<String, String>,
    ) {
        self.entries.insert(
            upstream.to_string(),
            CacheEntry {
                fetched_at: Instant::now(),
                tools,
                original_by_namespaced,
            },
        );
    }

    /// Invalidate one upstream's entry, or everything.
    pub fn invalidate(&mut self, upstream: Option<&str>) {
        match upstream {
            Some(upstream) => {
                self.entries.remove(upstream);
            }
            None => self.entries.clear(),
        }
    }

    /// The original tool name behind a namespaced name, if cached.
    pub fn original_name(&self, upstream: &str, namespaced: &str) -> Option<String> {
        self.get(upstream)
            .and_then(|entry| entry.original_by_namespaced.get(namespaced).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ToolRecord {
        ToolRecord {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::Map::new(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = ToolCache::new(Duration::from_millis(30));
        cache.insert("a", vec![record("echo")], HashMap::new());
        assert!(cache.get("a").is_some());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn invalidate_one_or_all() {
        let mut cache = ToolCache::default();
        cache.insert("a", vec![record("x")], HashMap::new());
        cache.insert("b", vec![record("y")], HashMap::new());

        cache.invalidate(Some("a"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());

        cache.invalidate(None);
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn original_name_resolves_through_the_map() {
        let mut cache = ToolCache::default();
        let map = HashMap::from([("demo.get_weather_".to_string(), "get weather!".to_string())]);
        cache.insert("demo", vec![record("get weather!")], map);

        assert_eq!(
            cache.original_name("demo", "demo.get_weather_").as_deref(),
            Some("get weather!")
        );
        assert!(cache.original_name("demo", "demo.unknown").is_none());
    }
}
