//! Key/value persistence for correlation state
//!
//! Pending dependency events survive restarts through a [`KeyValueStore`].
//! Keys follow a fixed layout:
//!
//! | Key                      | Value                              |
//! |--------------------------|------------------------------------|
//! | `<trigger>/<dependency>` | [`PendingEvent`] JSON              |
//! | `<trigger>/Expression`   | dependency expression string       |
//! | `Deps`                   | `{dependency: sha256-hex}` JSON    |
//! | `Triggers`               | `[trigger]` JSON                   |
//!
//! Every write after a read is revision checked, so two connections
//! writing the same key notice each other instead of silently overwriting.
//!
//! [`PendingEvent`]: crate::correlation::PendingEvent

pub mod jetstream;
pub mod memory;
pub mod pending;
pub mod redis;
pub mod spec_sync;

pub use jetstream::JetStreamKvStore;
pub use memory::MemoryStore;
pub use pending::PendingStateStore;
pub use self::redis::RedisStore;
pub use spec_sync::{sync_to_spec, ConsumerPurger, SyncReport};

use async_trait::async_trait;
use thiserror::Error;

/// Key holding the dependency → definition hash map
pub const DEPENDENCY_DEFINITIONS_KEY: &str = "Deps";

/// Key holding the list of trigger names
pub const TRIGGERS_KEY: &str = "Triggers";

/// Key of the pending event of one trigger dependency
pub fn dependency_key(trigger: &str, dependency: &str) -> String {
    format!("{}/{}", trigger, dependency)
}

/// Key of the stored expression of one trigger
pub fn expression_key(trigger: &str) -> String {
    format!("{}/Expression", trigger)
}

/// A stored value and the revision it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub revision: u64,
}

/// Errors raised by key/value stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// Conditional update lost against a concurrent writer
    #[error("revision mismatch for key '{key}'")]
    RevisionMismatch { key: String },

    /// Backend failure (connection, timeout, ...)
    #[error("store backend error: {0}")]
    Backend(String),

    /// Value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Minimal revisioned key/value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a key; `None` when missing or deleted
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;

    /// Unconditional write, returns the new revision
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError>;

    /// Conditional write
    ///
    /// `revision` must equal the key's current revision, or be `0` when the
    /// key must not exist yet. Returns the new revision.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RevisionMismatch` when another writer got there first.
    async fn update(&self, key: &str, value: Vec<u8>, revision: u64) -> Result<u64, StoreError>;

    /// Delete a key; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(dependency_key("trigger-1", "dep-a"), "trigger-1/dep-a");
        assert_eq!(expression_key("trigger-1"), "trigger-1/Expression");
    }
}
