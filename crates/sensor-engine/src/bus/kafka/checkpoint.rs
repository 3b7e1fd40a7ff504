//! Per-partition trigger checkpoints
//!
//! A checkpoint maps trigger names to the next trigger-topic offset that may
//! still fire them. It travels as JSON in the committed offset metadata, so
//! a trigger that already fired is not fired again when its records are
//! replayed after a restart.

use std::collections::{BTreeMap, HashMap};
use tracing::error;

/// Checkpoint of one topic partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// No committed offset existed; the first consumed offset must be committed
    pub init: bool,
    offsets: BTreeMap<String, i64>,
}

impl Checkpoint {
    /// Build the checkpoint of a newly assigned partition
    ///
    /// # Arguments
    ///
    /// * `committed` - Committed offset, `None` when the group has none
    /// * `metadata` - Metadata stored with the committed offset
    /// * `decode_metadata` - Only the trigger topic carries checkpoint metadata
    pub fn from_committed(committed: Option<i64>, metadata: &str, decode_metadata: bool) -> Self {
        let offsets = if decode_metadata && !metadata.is_empty() {
            serde_json::from_str(metadata).unwrap_or_else(|e| {
                error!(
                    metadata = %metadata,
                    error = %e,
                    error_id = "CHECKPOINT_METADATA_INVALID",
                    "Failed to decode checkpoint metadata, resetting"
                );
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };

        Self {
            init: committed.is_none(),
            offsets,
        }
    }

    /// Whether the record at `offset` was already handled for `key`
    pub fn skip(&self, key: &str, offset: i64) -> bool {
        self.offsets.get(key).is_some_and(|next| offset < *next)
    }

    pub fn set(&mut self, key: &str, offset: i64) {
        self.offsets.insert(key.to_string(), offset);
    }

    pub fn offset(&self, key: &str) -> Option<i64> {
        self.offsets.get(key).copied()
    }

    /// JSON metadata to commit with the offset; empty when nothing is tracked
    pub fn metadata(&self) -> String {
        if self.offsets.is_empty() {
            return String::new();
        }
        serde_json::to_string(&self.offsets).unwrap_or_else(|e| {
            error!(error = %e, error_id = "CHECKPOINT_METADATA_ENCODE_FAILED", "Failed to encode checkpoint metadata");
            String::new()
        })
    }
}

/// Checkpoints of every assigned partition, keyed by `(topic, partition)`
#[derive(Debug, Default)]
pub struct Checkpoints {
    partitions: HashMap<(String, i32), Checkpoint>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.partitions.clear();
    }

    pub fn insert(&mut self, topic: &str, partition: i32, checkpoint: Checkpoint) {
        self.partitions
            .insert((topic.to_string(), partition), checkpoint);
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<&Checkpoint> {
        self.partitions.get(&(topic.to_string(), partition))
    }

    /// Checkpoint of a partition, created empty when it was never assigned
    pub fn get_mut(&mut self, topic: &str, partition: i32) -> &mut Checkpoint {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
