use crate::store::{CacheResult, CacheStore, CacheStoreError};
use crate::types::{CacheEntry, KeyHash};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<KeyHash, CacheEntry>,
}

impl MemoryState {
    fn purge_expired(&mut self, now_ms: u64) {
        self.entries.retain(|_, entry| !entry.is_expired(now_ms));
    }

    fn evict_to_capacity(&mut self, max_entries: usize) {
        while self.entries.len() > max_entries {
            let oldest = self
                .entries
                .values()
                .min_by_key(|entry| (entry.created_at_ms, entry.key_hash.clone()))
                .map(|entry| entry.key_hash.clone());
            match oldest {
                Some(key) => {
                    let _ = self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Reference in-memory store. One mutex serializes `set`, so the
/// insert → expire → evict sequence is atomic with respect to concurrent
/// writers.
#[derive(Clone, Debug)]
pub struct MemoryCacheStore {
    inner: Arc<Mutex<MemoryState>>,
    max_entries: usize,
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState::default())),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|state| state.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key_hash: &KeyHash, now_ms: u64) -> CacheResult<Option<CacheEntry>> {
        let state = self
            .inner
            .lock()
            .map_err(|_| CacheStoreError::Backend("memory cache mutex poisoned".to_string()))?;
        Ok(state
            .entries
            .get(key_hash)
            .filter(|entry| !entry.is_expired(now_ms))
            .cloned())
    }

    async fn set(&self, entry: CacheEntry) -> CacheResult<()> {
        if entry.key_hash.is_empty() {
            return Err(CacheStoreError::InvalidEntry(
                "entry key hash is empty".to_string(),
            ));
        }
        let mut state = self
            .inner
            .lock()
            .map_err(|_| CacheStoreError::Backend("memory cache mutex poisoned".to_string()))?;
        let now_ms = entry.created_at_ms;
        let _ = state.entries.insert(entry.key_hash.clone(), entry);
        state.purge_expired(now_ms);
        state.evict_to_capacity(self.max_entries);
        Ok(())
    }
}
