//! Error types for query execution.

use reef_coord::CoordError;
use reef_types::{NodeId, ShardId};

use crate::budget::BudgetExhausted;

/// Errors raised while planning or running a query.
///
/// Only [`QueryError::Coord`] (for example an unknown item scope) reaches
/// the caller of [`QueryCoordinator::execute`](crate::QueryCoordinator::execute);
/// per-shard failures are recorded in the response instead.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    BudgetExhausted(#[from] BudgetExhausted),

    /// No engine or transport reached the replica's node.
    #[error("replica unreachable on {0}")]
    ReplicaUnreachable(NodeId),

    /// The embedding provider is missing or failed.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// A vector or graph backend failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// A shard search ran past its time slice.
    #[error("search on {0} timed out")]
    Timeout(ShardId),

    #[error(transparent)]
    Coord(#[from] CoordError),
}
