//! Cache-aside layer over a disposable key-value store.
//!
//! The relational store stays authoritative. Every entry here is a derived,
//! TTL-bounded shadow that write paths delete or pattern-invalidate, and every
//! read path survives the store being slow, corrupt or gone.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod helper;
pub mod keys;
pub mod memory;
pub mod redis_store;

pub use helper::{CacheHelper, CacheLookup};
pub use keys::CacheKeys;
pub use memory::MemoryCacheStore;
pub use redis_store::RedisCacheStore;

/// Failures of the cache store. None of these ever fail a business operation.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("cache store error: {0}")]
    Backend(String),

    #[error("cache entry could not be (de)serialized: {0}")]
    Serialization(String),
}

impl CacheError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::Unavailable(_))
    }
}

/// TTL class of a cache entry; durations come from `CacheSettings`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    /// Attempts and answers: change on nearly every request.
    Fast,
    Assessment,
    Question,
    Stats,
    Exists,
}

/// Minimal capability set the cache-aside helper needs from a key-value store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Deletes all `keys` in one round trip and returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// One incremental scan step. A returned cursor of 0 ends the iteration.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError>;
}
