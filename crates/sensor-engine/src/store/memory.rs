//! In-memory key/value store
//!
//! Used by tests and by deployments that run without persisted state.

use super::{KeyValueStore, KvEntry, StoreError};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent in-memory store with bucket-wide revisions
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, KvEntry>,
    revision: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError> {
        let revision = self.next_revision();
        self.entries.insert(key.to_string(), KvEntry { value, revision });
        Ok(revision)
    }

    async fn update(&self, key: &str, value: Vec<u8>, revision: u64) -> Result<u64, StoreError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().revision != revision {
                    return Err(StoreError::RevisionMismatch { key: key.to_string() });
                }
                let next = self.next_revision();
                occupied.insert(KvEntry { value, revision: next });
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                if revision != 0 {
                    return Err(StoreError::RevisionMismatch { key: key.to_string() });
                }
                let next = self.next_revision();
                vacant.insert(KvEntry { value, revision: next });
                Ok(next)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        let rev = store.put("k", b"v1".to_vec()).await.unwrap();
        let entry = store.get("k").await.unwrap().unwrap();
        assert_eq!(entry.value, b"v1");
        assert_eq!(entry.revision, rev);

        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_requires_current_revision() {
        let store = MemoryStore::new();
        let rev = store.update("k", b"v1".to_vec(), 0).await.unwrap();

        assert!(matches!(
            store.update("k", b"v2".to_vec(), 0).await,
            Err(StoreError::RevisionMismatch { .. })
        ));
        assert!(matches!(
            store.update("k", b"v2".to_vec(), rev + 10).await,
            Err(StoreError::RevisionMismatch { .. })
        ));

        let rev2 = store.update("k", b"v2".to_vec(), rev).await.unwrap();
        assert!(rev2 > rev);
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"v2");
    }

    #[tokio::test]
    async fn test_update_missing_key_with_revision() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update("k", b"v".to_vec(), 3).await,
            Err(StoreError::RevisionMismatch { .. })
        ));
        assert!(store.is_empty());
    }
}
