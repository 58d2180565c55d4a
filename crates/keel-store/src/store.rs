use crate::types::{CacheEntry, KeyHash};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("cache store backend error: {0}")]
    Backend(String),
    #[error("invalid cache entry: {0}")]
    InvalidEntry(String),
}

pub type CacheResult<T> = Result<T, CacheStoreError>;

/// Cache store contract. Shared across sessions (typically per-process);
/// implementations must make the insert → expire → evict sequence of `set`
/// one atomic unit so the capacity invariant is never observable as broken.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry. Expired entries are treated as absent.
    async fn get(&self, key_hash: &KeyHash, now_ms: u64) -> CacheResult<Option<CacheEntry>>;

    /// Insert or replace, then evict expired entries, then evict
    /// oldest-by-creation-time entries while over capacity.
    async fn set(&self, entry: CacheEntry) -> CacheResult<()>;
}
