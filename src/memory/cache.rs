//! Cache backends
//!
//! A small Redis-shaped surface (GET / SETEX / DEL / KEYS / ZADD / ZRANGE)
//! that the memory manager builds its namespaces on. Values are opaque bytes.

use crate::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Durable key-value store with per-key expiry
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Live keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Store `value` under `member_key`, index it in `index_key` by `score`,
    /// then trim the index to the `cap` highest scores.
    ///
    /// Trimmed members are removed from the index and the value store in the
    /// same atomic step. Returns the number of evicted members.
    async fn push_bounded(
        &self,
        index_key: &str,
        member_key: &str,
        score: f64,
        value: Vec<u8>,
        ttl: Duration,
        cap: usize,
    ) -> Result<usize>;

    /// Index members in ascending score order
    async fn range(&self, index_key: &str) -> Result<Vec<String>>;

    /// Reclaim space held by expired entries whose key starts with `prefix`,
    /// or every expired entry when `prefix` is `None`. Returns how many were
    /// dropped.
    async fn purge_expired(&self, prefix: Option<&str>) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn new(value: Vec<u8>, now: Instant, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    /// index key → (score, member) sorted ascending by score
    indexes: HashMap<String, Vec<(f64, String)>>,
}

impl CacheState {
    fn prune_index(&mut self, index_key: &str, now: Instant) {
        let entries = &self.entries;
        if let Some(index) = self.indexes.get_mut(index_key) {
            index.retain(|(_, member)| {
                entries
                    .get(member)
                    .map(|entry| !entry.is_expired(now))
                    .unwrap_or(false)
            });
            if index.is_empty() {
                self.indexes.remove(index_key);
            }
        }
    }
}

/// Process-local cache; the fallback when no durable cache is reachable.
///
/// All state sits behind one lock, which is what makes `push_bounded` atomic.
/// Uses tokio's clock so tests can pause and advance time.
pub struct InMemoryCache {
    state: Mutex<CacheState>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CacheBackend for InMemoryCache {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let expired = match state.entries.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => return Ok(Some(entry.value.clone())),
            None => return Ok(None),
        };

        if expired {
            state.entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.entries.insert(key.to_string(), Entry::new(value, now, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let removed_entry = state.entries.remove(key).is_some();
        let removed_index = match state.indexes.remove(key) {
            Some(members) => {
                for (_, member) in members {
                    state.entries.remove(&member);
                }
                true
            }
            None => false,
        };
        Ok(removed_entry || removed_index)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        state
            .entries
            .retain(|key, entry| !(key.starts_with(prefix) && entry.is_expired(now)));

        let index_keys: Vec<String> = state
            .indexes
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for index_key in &index_keys {
            state.prune_index(index_key, now);
        }

        let mut keys: Vec<String> = state
            .entries
            .keys()
            .chain(state.indexes.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn push_bounded(
        &self,
        index_key: &str,
        member_key: &str,
        score: f64,
        value: Vec<u8>,
        ttl: Duration,
        cap: usize,
    ) -> Result<usize> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        state
            .entries
            .insert(member_key.to_string(), Entry::new(value, now, ttl));

        let index = state.indexes.entry(index_key.to_string()).or_default();
        index.retain(|(_, member)| member != member_key);
        let position = index.partition_point(|(s, _)| *s <= score);
        index.insert(position, (score, member_key.to_string()));

        let overflow = index.len().saturating_sub(cap);
        let evicted: Vec<String> = index.drain(..overflow).map(|(_, m)| m).collect();
        if index.is_empty() {
            state.indexes.remove(index_key);
        }

        for member in &evicted {
            state.entries.remove(member);
        }

        Ok(evicted.len())
    }

    async fn range(&self, index_key: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.prune_index(index_key, now);

        Ok(state
            .indexes
            .get(index_key)
            .map(|index| index.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn purge_expired(&self, prefix: Option<&str>) -> Result<usize> {
        let now = Instant::now();
        let in_scope = |key: &str| prefix.map_or(true, |p| key.starts_with(p));
        let mut state = self.state.lock().await;

        let before = state.entries.len();
        state
            .entries
            .retain(|key, entry| !(in_scope(key.as_str()) && entry.is_expired(now)));
        let purged = before - state.entries.len();

        let index_keys: Vec<String> = state
            .indexes
            .keys()
            .filter(|key| in_scope(key.as_str()))
            .cloned()
            .collect();
        for index_key in &index_keys {
            state.prune_index(index_key, now);
        }

        Ok(purged)
    }
}
