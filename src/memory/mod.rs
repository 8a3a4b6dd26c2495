//! Agent Memory
//!
//! TTL-governed key-value storage shared by the executor, reflector and
//! orchestrator. Redis when available, process-local otherwise.

pub mod cache;
pub mod manager;
#[cfg(feature = "redis")]
pub mod redis_cache;

pub use cache::{CacheBackend, InMemoryCache};
pub use manager::{keys, MemoryManager};
#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;
