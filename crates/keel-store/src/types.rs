use serde::{Deserialize, Serialize};

/// Hex blake3 digest used as the cache key.
pub type KeyHash = String;

/// One cached payload. A store never hands back an entry whose
/// `expires_at_ms <= now`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key_hash: KeyHash,
    pub payload: Vec<u8>,
    pub byte_len: usize,
    pub kind: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl CacheEntry {
    pub fn new(
        payload: Vec<u8>,
        kind: impl Into<String>,
        created_at_ms: u64,
        ttl_ms: u64,
    ) -> Self {
        let key_hash = content_hash(&payload);
        let byte_len = payload.len();
        Self {
            key_hash,
            payload,
            byte_len,
            kind: kind.into(),
            created_at_ms,
            expires_at_ms: created_at_ms.saturating_add(ttl_ms),
        }
    }

    /// Entry keyed by the caller instead of by payload content, for caches
    /// where the key derives from the request rather than the response.
    pub fn with_key(
        key_hash: impl Into<KeyHash>,
        payload: Vec<u8>,
        kind: impl Into<String>,
        created_at_ms: u64,
        ttl_ms: u64,
    ) -> Self {
        let byte_len = payload.len();
        Self {
            key_hash: key_hash.into(),
            payload,
            byte_len,
            kind: kind.into(),
            created_at_ms,
            expires_at_ms: created_at_ms.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

pub fn content_hash(payload: &[u8]) -> KeyHash {
    blake3::hash(payload).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_expiry_boundary_is_inclusive() {
        let entry = CacheEntry::new(b"payload".to_vec(), "llm_response", 1_000, 500);
        assert!(!entry.is_expired(1_499));
        assert!(entry.is_expired(1_500));
    }

    #[test]
    fn content_hash_is_stable_per_payload() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
    }
}
