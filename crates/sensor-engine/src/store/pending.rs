//! Persisted pending events of one trigger
//!
//! Wraps a [`KeyValueStore`] with the `<trigger>/<dependency>` layout and
//! remembers the last revision seen per key, so every save is a
//! revision-checked update.

use super::{dependency_key, KeyValueStore, StoreError};
use crate::correlation::PendingEvent;
use std::collections::HashMap;
use std::sync::Arc;

/// Pending event persistence for a single trigger
pub struct PendingStateStore {
    kv: Arc<dyn KeyValueStore>,
    trigger_name: String,
    revisions: HashMap<String, u64>,
}

impl PendingStateStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, trigger_name: impl Into<String>) -> Self {
        Self {
            kv,
            trigger_name: trigger_name.into(),
            revisions: HashMap::new(),
        }
    }

    /// Load the stored pending event of a dependency
    ///
    /// Entries that do not decode are logged and treated as absent.
    pub async fn load(&mut self, dependency: &str) -> Result<Option<PendingEvent>, StoreError> {
        let key = dependency_key(&self.trigger_name, dependency);
        let Some(entry) = self.kv.get(&key).await? else {
            self.revisions.remove(dependency);
            return Ok(None);
        };

        self.revisions.insert(dependency.to_string(), entry.revision);
        match serde_json::from_slice::<PendingEvent>(&entry.value) {
            Ok(pending) => Ok(Some(pending)),
            Err(e) => {
                tracing::warn!(
                    trigger = %self.trigger_name,
                    dependency = %dependency,
                    error = %e,
                    error_id = "PENDING_STATE_CORRUPT",
                    "Ignoring undecodable pending event"
                );
                Ok(None)
            }
        }
    }

    /// Save the pending event of a dependency
    ///
    /// On a revision conflict the current revision is re-read and the save
    /// retried once. A second conflict is returned to the caller.
    pub async fn save(&mut self, dependency: &str, pending: &PendingEvent) -> Result<(), StoreError> {
        let key = dependency_key(&self.trigger_name, dependency);
        let value = serde_json::to_vec(pending)?;
        let expected = self.revisions.get(dependency).copied().unwrap_or(0);

        let revision = match self.kv.update(&key, value.clone(), expected).await {
            Ok(revision) => revision,
            Err(StoreError::RevisionMismatch { .. }) => {
                let current = self.kv.get(&key).await?.map(|e| e.revision).unwrap_or(0);
                tracing::warn!(
                    trigger = %self.trigger_name,
                    dependency = %dependency,
                    expected_revision = expected,
                    current_revision = current,
                    error_id = "PENDING_STATE_CONFLICT",
                    "Pending event was modified by another writer, overwriting"
                );
                self.kv.update(&key, value, current).await?
            }
            Err(e) => return Err(e),
        };

        self.revisions.insert(dependency.to_string(), revision);
        Ok(())
    }

    /// Delete the pending event of a dependency
    pub async fn delete(&mut self, dependency: &str) -> Result<(), StoreError> {
        self.kv
            .delete(&dependency_key(&self.trigger_name, dependency))
            .await?;
        self.revisions.remove(dependency);
        Ok(())
    }
}
