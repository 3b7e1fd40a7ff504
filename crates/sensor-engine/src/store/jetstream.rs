//! JetStream key/value bucket store
//!
//! One bucket per sensor, named after the sensor. JetStream revisions are
//! the bucket stream sequence, so conditional updates map directly onto
//! `create` (revision 0) and `update`.

use super::{KeyValueStore, KvEntry, StoreError};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;

/// Store backed by a JetStream key/value bucket
#[derive(Clone)]
pub struct JetStreamKvStore {
    store: kv::Store,
    bucket: String,
}

impl JetStreamKvStore {
    /// Open the sensor bucket, creating it when it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` when the bucket can neither be found
    /// nor created.
    pub async fn open(context: &jetstream::Context, bucket: &str) -> Result<Self, StoreError> {
        let store = match context.get_key_value(bucket).await {
            Ok(store) => store,
            Err(lookup_err) => {
                tracing::info!(
                    bucket = %bucket,
                    reason = %lookup_err,
                    "Key/value bucket not found, creating it"
                );
                context
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        StoreError::backend(format!("failed to create bucket {}: {}", bucket, e))
                    })?
            }
        };

        Ok(Self {
            store,
            bucket: bucket.to_string(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl KeyValueStore for JetStreamKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| StoreError::backend(e.to_string()))?;

        Ok(entry.and_then(|entry| match entry.operation {
            kv::Operation::Put => Some(KvEntry {
                value: entry.value.to_vec(),
                revision: entry.revision,
            }),
            kv::Operation::Delete | kv::Operation::Purge => None,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError> {
        self.store
            .put(key, value.into())
            .await
            .map_err(|e| StoreError::backend(e.to_string()))
    }

    async fn update(&self, key: &str, value: Vec<u8>, revision: u64) -> Result<u64, StoreError> {
        if revision == 0 {
            return self.store.create(key, value.into()).await.map_err(|e| {
                match e.kind() {
                    kv::CreateErrorKind::AlreadyExists => {
                        StoreError::RevisionMismatch { key: key.to_string() }
                    }
                    _ => StoreError::backend(e.to_string()),
                }
            });
        }

        self.store
            .update(key, value.into(), revision)
            .await
            .map_err(|e| match e.kind() {
                kv::UpdateErrorKind::WrongLastRevision => {
                    StoreError::RevisionMismatch { key: key.to_string() }
                }
                _ => StoreError::backend(e.to_string()),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store
            .delete(key)
            .await
            .map_err(|e| StoreError::backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_store() -> JetStreamKvStore {
        let url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
        let client = async_nats::connect(url).await.expect("Failed to connect to NATS");
        let context = jetstream::new(client);
        JetStreamKvStore::open(&context, &format!("test-{}", uuid::Uuid::new_v4().simple()))
            .await
            .expect("Failed to open bucket")
    }

    #[tokio::test]
    #[ignore] // Requires a NATS server with JetStream enabled
    async fn test_jetstream_conditional_update() {
        let store = setup_store().await;

        let rev = store.update("t/dep", b"one".to_vec(), 0).await.unwrap();
        assert!(matches!(
            store.update("t/dep", b"two".to_vec(), 0).await,
            Err(StoreError::RevisionMismatch { .. })
        ));
        let rev2 = store.update("t/dep", b"two".to_vec(), rev).await.unwrap();
        assert!(rev2 > rev);

        store.delete("t/dep").await.unwrap();
        assert!(store.get("t/dep").await.unwrap().is_none());

        // a deleted key can be created again
        store.update("t/dep", b"three".to_vec(), 0).await.unwrap();
    }
}
