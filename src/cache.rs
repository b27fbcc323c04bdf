//! Cache boundary consumed by the discovery layer.
//!
//! The discoverer only needs three operations over structured values, so
//! that is the whole contract. [`MemoryCache`] is a process-local
//! implementation good enough for tests and single-process monitors;
//! deployments with shared state plug in their own store.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use globset::Glob;
use serde_json::Value;
use tokio::sync::Mutex;

#[async_trait]
pub trait Cache: Send + Sync {
    /// The value under `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Duration);

    /// Remove every key matching the glob `pattern`; returns how many
    /// entries were removed.
    async fn clear(&self, pattern: &str) -> usize;
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// In-memory TTL cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().await.insert(key.to_string(), entry);
    }

    async fn clear(&self, pattern: &str) -> usize {
        let Ok(glob) = Glob::new(pattern) else {
            return 0;
        };
        let matcher = glob.compile_matcher();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| !matcher.is_match(key));
        before - entries.len()
    }
}
