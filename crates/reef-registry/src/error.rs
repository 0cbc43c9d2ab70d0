//! Error types for registry operations.

use reef_meta::MetaError;
use reef_types::{ItemId, PayloadError, ShardId};

/// Errors returned by [`ShardRegistry`](crate::ShardRegistry).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    /// The shard changed underneath an operation that expected it not to.
    /// Callers retry after re-reading.
    #[error("conflicting update on shard {shard_id}: {reason}")]
    Conflict { shard_id: ShardId, reason: String },

    /// The request does not describe a valid shard set.
    #[error("invalid shard set: {0}")]
    Invalid(String),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// Persisting the change failed. The in-memory registry already holds it.
    #[error("metadata persistence failed: {0}")]
    Meta(#[from] MetaError),
}

impl RegistryError {
    pub(crate) fn conflict(shard_id: &ShardId, reason: impl Into<String>) -> Self {
        Self::Conflict {
            shard_id: shard_id.clone(),
            reason: reason.into(),
        }
    }
}
