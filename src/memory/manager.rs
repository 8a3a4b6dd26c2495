//! Memory Manager
//!
//! Namespaced, TTL-governed storage for task results, sessions, user
//! preferences, intermediate results and the bounded per-user interaction log.
//!
//! The manager owns a primary backend (Redis when configured) and a
//! process-local fallback. The first storage failure flips it into degraded
//! mode for the rest of the process lifetime.

use super::cache::{CacheBackend, InMemoryCache};
use crate::config::{AgentConfig, TtlPolicy};
use crate::models::{InteractionRecord, Session, TaskResult};
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Key layout shared by every backend
pub mod keys {
    pub const TASK_RESULT: &str = "task_result:";
    pub const CONVERSATION: &str = "conversation:";
    pub const USER_PREFERENCES: &str = "user_preferences:";
    pub const INTERMEDIATE: &str = "intermediate_result:";

    pub fn task_result(task_id: &str) -> String {
        format!("{}{}", TASK_RESULT, task_id)
    }

    pub fn conversation(session_id: &str) -> String {
        format!("{}{}", CONVERSATION, session_id)
    }

    pub fn user_preferences(user_id: &str) -> String {
        format!("{}{}", USER_PREFERENCES, user_id)
    }

    pub fn intermediate(session_id: &str, step: &str) -> String {
        format!("{}{}:{}", INTERMEDIATE, session_id, step)
    }

    pub fn interaction_index(user_id: &str) -> String {
        format!("interactions:{}:chats", user_id)
    }

    pub fn interaction(user_id: &str, id: &str) -> String {
        format!("interaction:{}:{}", user_id, id)
    }
}

pub struct MemoryManager {
    primary: Arc<dyn CacheBackend>,
    fallback: Arc<InMemoryCache>,
    degraded: AtomicBool,
    ttl: TtlPolicy,
    interaction_cap: usize,
}

impl MemoryManager {
    pub fn new(primary: Arc<dyn CacheBackend>, ttl: TtlPolicy, interaction_cap: usize) -> Self {
        Self {
            primary,
            fallback: Arc::new(InMemoryCache::new()),
            degraded: AtomicBool::new(false),
            ttl,
            interaction_cap,
        }
    }

    /// Process-local memory only
    pub fn in_memory(ttl: TtlPolicy, interaction_cap: usize) -> Self {
        let fallback = Arc::new(InMemoryCache::new());
        Self {
            primary: fallback.clone(),
            fallback,
            degraded: AtomicBool::new(false),
            ttl,
            interaction_cap,
        }
    }

    /// Use Redis when a URL is configured and reachable, otherwise in-memory
    pub async fn connect(config: &AgentConfig) -> Self {
        let ttl = config.ttl.clone();
        let cap = config.interaction_log_cap;

        match config.redis_url.as_deref() {
            Some(url) => Self::connect_redis(url, ttl, cap).await,
            None => {
                info!("No Redis configured, using in-memory cache");
                Self::in_memory(ttl, cap)
            }
        }
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(url: &str, ttl: TtlPolicy, cap: usize) -> Self {
        match super::redis_cache::RedisCache::connect(url).await {
            Ok(cache) => Self::new(Arc::new(cache), ttl, cap),
            Err(e) => {
                warn!(error = %e, "Redis unavailable, falling back to in-memory cache");
                Self::in_memory(ttl, cap)
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(_url: &str, ttl: TtlPolicy, cap: usize) -> Self {
        warn!("Built without the redis feature, using in-memory cache");
        Self::in_memory(ttl, cap)
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Name of the backend currently serving requests
    pub fn backend_name(&self) -> &'static str {
        if self.is_degraded() {
            self.fallback.name()
        } else {
            self.primary.name()
        }
    }

    /// Run `op` against the primary backend; on a storage failure switch to
    /// the fallback and run it there.
    async fn with_backend<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn CacheBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.is_degraded() {
            match f(self.primary.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_storage() => {
                    warn!(
                        op = op,
                        backend = self.primary.name(),
                        error = %e,
                        "Cache backend failed, degrading to in-memory"
                    );
                    self.degraded.store(true, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }

        let fallback: Arc<dyn CacheBackend> = self.fallback.clone();
        f(fallback).await
    }

    // =============================
    // Raw Access
    // =============================

    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_backend("get", |b| async move { b.get(key).await })
            .await
    }

    pub async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.with_backend("set", |b| {
            let value = value.clone();
            async move { b.set_ex(key, value, ttl).await }
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.with_backend("delete", |b| async move { b.delete(key).await })
            .await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set_raw(key, bytes, ttl).await
    }

    // =============================
    // Task Results
    // =============================

    pub async fn save_task_result(&self, result: &TaskResult) -> Result<()> {
        debug!(task_id = %result.task_id, "Saving task result");
        self.set(&keys::task_result(&result.task_id), result, self.ttl.task_result)
            .await
    }

    pub async fn get_task_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        self.get(&keys::task_result(task_id)).await
    }

    // =============================
    // Sessions
    // =============================

    pub async fn save_session(&self, session: &Session) -> Result<()> {
        debug!(
            session_id = %session.session_id,
            iterations = session.execution_history.len(),
            "Saving session"
        );
        self.set(
            &keys::conversation(&session.session_id),
            session,
            self.ttl.conversation,
        )
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.get(&keys::conversation(session_id)).await
    }

    // =============================
    // User Preferences
    // =============================

    pub async fn save_user_preferences(&self, user_id: &str, preferences: &Value) -> Result<()> {
        self.set(
            &keys::user_preferences(user_id),
            preferences,
            self.ttl.user_preferences,
        )
        .await
    }

    pub async fn get_user_preferences(&self, user_id: &str) -> Result<Option<Value>> {
        self.get(&keys::user_preferences(user_id)).await
    }

    // =============================
    // Intermediate Results
    // =============================

    pub async fn save_intermediate_result<T: Serialize>(
        &self,
        session_id: &str,
        step: &str,
        value: &T,
    ) -> Result<()> {
        self.set(
            &keys::intermediate(session_id, step),
            value,
            self.ttl.intermediate,
        )
        .await
    }

    pub async fn get_intermediate_result<T: DeserializeOwned>(
        &self,
        session_id: &str,
        step: &str,
    ) -> Result<Option<T>> {
        self.get(&keys::intermediate(session_id, step)).await
    }

    // =============================
    // Interaction Log
    // =============================

    /// Append to the user's log, keeping only the most recent entries.
    /// Returns how many old entries were evicted.
    pub async fn append_interaction(&self, record: &InteractionRecord) -> Result<usize> {
        let index_key = keys::interaction_index(&record.user_id);
        let member_key = keys::interaction(&record.user_id, &record.id.to_string());
        let (index_key, member_key) = (index_key.as_str(), member_key.as_str());
        let score = record.timestamp.timestamp_micros() as f64;
        let bytes = serde_json::to_vec(record)?;
        let ttl = self.ttl.interaction;
        let cap = self.interaction_cap;

        let evicted = self
            .with_backend("append_interaction", |b| {
                let bytes = bytes.clone();
                async move {
                    b.push_bounded(index_key, member_key, score, bytes, ttl, cap)
                        .await
                }
            })
            .await?;

        if evicted > 0 {
            debug!(user_id = %record.user_id, evicted, "Trimmed interaction log");
        }
        Ok(evicted)
    }

    /// Oldest first
    pub async fn recent_interactions(&self, user_id: &str) -> Result<Vec<InteractionRecord>> {
        let index_key = keys::interaction_index(user_id);
        let index_key = index_key.as_str();
        let members = self
            .with_backend("recent_interactions", |b| async move { b.range(index_key).await })
            .await?;

        let mut records = Vec::with_capacity(members.len());
        for member in members {
            if let Some(record) = self.get::<InteractionRecord>(&member).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    // =============================
    // Maintenance
    // =============================

    /// Drop expired entries under `prefix` (a `keys::*` namespace), or in
    /// every namespace when `None`
    pub async fn cleanup_expired(&self, prefix: Option<&str>) -> Result<usize> {
        let purged = self
            .with_backend("cleanup_expired", |b| async move { b.purge_expired(prefix).await })
            .await?;
        if purged > 0 {
            info!(purged, prefix = prefix.unwrap_or("*"), "Expired memory entries cleaned up");
        } else {
            debug!(prefix = prefix.unwrap_or("*"), "No expired memory entries");
        }
        Ok(purged)
    }

    /// Sweep every namespace once per `period` until the handle is aborted
    pub fn spawn_cleanup(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = self.cleanup_expired(None).await {
                    warn!(error = %e, "Memory cleanup sweep failed");
                }
            }
        })
    }

    /// Drop the session record and its intermediate results
    pub async fn clear_session_memory(&self, session_id: &str) -> Result<usize> {
        let mut cleared = 0;
        if self.delete(&keys::conversation(session_id)).await? {
            cleared += 1;
        }

        let prefix = keys::intermediate(session_id, "");
        for key in self.keys(&prefix).await? {
            if self.delete(&key).await? {
                cleared += 1;
            }
        }

        info!(session_id = %session_id, cleared, "Session memory cleared");
        Ok(cleared)
    }

    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_backend("keys", |b| async move { b.keys(prefix).await })
            .await
    }

    pub async fn count_keys(&self, prefix: &str) -> Result<usize> {
        Ok(self.keys(prefix).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use crate::models::{Task, TaskType};
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    /// Backend whose every call fails like an unreachable Redis
    struct UnreachableCache;

    #[async_trait::async_trait]
    impl CacheBackend for UnreachableCache {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(OrchestrationError::StorageError("connection refused".into()))
        }

        async fn set_ex(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<()> {
            Err(OrchestrationError::StorageError("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(OrchestrationError::StorageError("connection refused".into()))
        }

        async fn keys(&self, _prefix: &str) -> Result<Vec<String>> {
            Err(OrchestrationError::StorageError("connection refused".into()))
        }

        async fn push_bounded(
            &self,
            _index_key: &str,
            _member_key: &str,
            _score: f64,
            _value: Vec<u8>,
            _ttl: Duration,
            _cap: usize,
        ) -> Result<usize> {
            Err(OrchestrationError::StorageError("connection refused".into()))
        }

        async fn range(&self, _index_key: &str) -> Result<Vec<String>> {
            Err(OrchestrationError::StorageError("connection refused".into()))
        }

        async fn purge_expired(&self, _prefix: Option<&str>) -> Result<usize> {
            Err(OrchestrationError::StorageError("connection refused".into()))
        }
    }

    fn manager() -> MemoryManager {
        MemoryManager::in_memory(TtlPolicy::default(), 10)
    }

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            name: "collect".to_string(),
            description: "collect market data".to_string(),
            tool_name: "web_scraping".to_string(),
            parameters: Default::default(),
            dependencies: vec![],
            task_type: TaskType::DataCollection,
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_task_result_round_trip() {
        let memory = manager();
        let result = TaskResult::success(&sample_task("task_0"), json!({"rows": 3}), 0.2);

        assert_ok!(memory.save_task_result(&result).await);
        let loaded = memory.get_task_result("task_0").await.unwrap().unwrap();

        assert_eq!(loaded.task_id, "task_0");
        assert_eq!(loaded.data, Some(json!({"rows": 3})));
        assert_eq!(memory.count_keys(keys::TASK_RESULT).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_is_a_miss() {
        let memory = manager();
        assert_ok!(
            memory
                .set("task_result:short", &json!("v"), Duration::from_secs(1))
                .await
        );

        tokio::time::advance(Duration::from_millis(1100)).await;

        let value: Option<Value> = memory.get("task_result:short").await.unwrap();
        assert!(value.is_none());
        assert_eq!(memory.count_keys("task_result:").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_interaction_log_keeps_ten_most_recent() {
        let memory = manager();
        let base = Utc::now();

        for i in 0..15 {
            let mut record = InteractionRecord::new("u1", "s1", format!("q{}", i), "a");
            record.timestamp = base + ChronoDuration::seconds(i);
            memory.append_interaction(&record).await.unwrap();
        }

        let recent = memory.recent_interactions("u1").await.unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent.first().unwrap().user_message, "q5");
        assert_eq!(recent.last().unwrap().user_message, "q14");
        assert_eq!(memory.count_keys("interaction:u1:").await.unwrap(), 10);

        // other users are unaffected
        assert!(memory.recent_interactions("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_session_memory() {
        let memory = manager();
        let session = Session::new("s1", "hello");
        memory.save_session(&session).await.unwrap();
        memory
            .save_intermediate_result("s1", "plan", &json!({"tasks": 2}))
            .await
            .unwrap();
        memory
            .save_intermediate_result("s2", "plan", &json!({"tasks": 1}))
            .await
            .unwrap();

        assert_eq!(memory.clear_session_memory("s1").await.unwrap(), 2);
        assert!(memory.get_session("s1").await.unwrap().is_none());

        let other: Option<Value> = memory.get_intermediate_result("s2", "plan").await.unwrap();
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_in_memory() {
        let memory = MemoryManager::new(Arc::new(UnreachableCache), TtlPolicy::default(), 10);
        assert!(!memory.is_degraded());

        let result = TaskResult::success(&sample_task("task_7"), json!({}), 0.1);
        assert_ok!(memory.save_task_result(&result).await);

        assert!(memory.is_degraded());
        assert_eq!(memory.backend_name(), "in-memory");
        assert!(memory.get_task_result("task_7").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_value_is_serialization_error() {
        let memory = manager();
        memory
            .set_raw("task_result:bad", b"not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let err = assert_err!(memory.get_task_result("bad").await);
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired_by_namespace() {
        let memory = manager();
        for i in 0..1000 {
            memory
                .set_raw(&keys::task_result(&format!("task_{}", i)), vec![1], Duration::from_secs(1))
                .await
                .unwrap();
        }
        memory
            .save_intermediate_result("s1", "plan", &json!({"tasks": 2}))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;

        assert_eq!(memory.cleanup_expired(Some(keys::TASK_RESULT)).await.unwrap(), 1000);
        assert_eq!(memory.cleanup_expired(Some(keys::TASK_RESULT)).await.unwrap(), 0);

        // intermediate results (30 min TTL) are expired too but outside the namespace
        assert_eq!(memory.cleanup_expired(Some(keys::INTERMEDIATE)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_sweep_runs_periodically() {
        let memory = Arc::new(manager());
        memory
            .set_raw("task_result:old", vec![1], Duration::from_secs(1))
            .await
            .unwrap();
        memory
            .set_raw("task_result:fresh", vec![2], Duration::from_secs(86_400))
            .await
            .unwrap();

        let sweep = memory.clone().spawn_cleanup(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        // the sweep already dropped the expired entry
        assert_eq!(memory.cleanup_expired(None).await.unwrap(), 0);
        assert_eq!(
            memory.keys(keys::TASK_RESULT).await.unwrap(),
            vec!["task_result:fresh".to_string()]
        );

        sweep.abort();
    }

    #[tokio::test]
    async fn test_connect_without_redis_uses_memory() {
        let config = AgentConfig::default();
        let memory = MemoryManager::connect(&config).await;
        assert_eq!(memory.backend_name(), "in-memory");
    }
}
