//! Error types for shard coordination.

use reef_meta::MetaError;
use reef_placement::PlacementError;
use reef_registry::RegistryError;
use reef_store::StoreError;
use reef_types::{PayloadError, ShardId};

/// Errors returned by [`ShardCoordinator`](crate::ShardCoordinator).
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    /// Fewer than the write quorum of replicas acknowledged a write.
    #[error("write quorum not reached for {shard_id}: {acked}/{required} acknowledgements")]
    QuorumNotReached {
        shard_id: ShardId,
        acked: usize,
        required: usize,
    },

    /// A copied payload did not hash back to its expected root.
    #[error("migration verification failed for {shard_id}: {reason}")]
    MigrationVerificationFailed { shard_id: ShardId, reason: String },

    /// No healthy member of a set still holds an intact payload.
    #[error("no intact copy of {0} left")]
    NoSource(ShardId),
}

impl CoordError {
    /// Whether the operation lost a race with a concurrent change and may
    /// succeed if retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::Conflict { .. }))
    }
}
