//! [`ReefEngine`]: the operations external orchestration calls.
//!
//! Transports and CLIs depend on this trait instead of the concrete
//! [`ReefNode`](crate::ReefNode).

use reef_coord::ClusterStats;
use reef_query::{QueryRequest, QueryResponse};
use reef_types::{Cid, CollectionId, ItemId, NodeId, ShardId};

use crate::error::EngineError;

/// Cluster membership, item placement and query execution.
///
/// `assign_item` is idempotent on the item id; `execute` is read-only and
/// safe to retry.
#[async_trait::async_trait]
pub trait ReefEngine: Send + Sync {
    /// Join a node to the ring.
    async fn add_node(&self, node_id: NodeId) -> Result<(), EngineError>;

    /// Remove a node, promoting replicas of the shards it owned.
    async fn remove_node(&self, node_id: &NodeId) -> Result<(), EngineError>;

    /// Place an item and return its shard set, primary first.
    async fn assign_item(
        &self,
        collection: &CollectionId,
        item_id: &ItemId,
        item_cid: Cid,
    ) -> Result<Vec<ShardId>, EngineError>;

    /// Run a query. Shard failures are reported in the response.
    async fn execute(&self, request: QueryRequest) -> Result<QueryResponse, EngineError>;

    /// Per-node and per-shard counts.
    async fn get_stats(&self) -> Result<ClusterStats, EngineError>;
}
