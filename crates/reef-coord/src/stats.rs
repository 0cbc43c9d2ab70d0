//! Per-node and per-shard counts for external monitoring.

use std::collections::BTreeMap;

use reef_types::{CollectionId, NodeId, RebalanceState, ShardId};
use serde::Serialize;

use crate::coordinator::ShardCoordinator;

/// Shard and item counts of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub primary_shards: usize,
    pub replica_shards: usize,
    /// Items across every shard the node hosts, replicas included.
    pub items: u64,
}

/// Snapshot of one shard record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    pub shard_id: ShardId,
    pub collection: CollectionId,
    pub node_id: NodeId,
    /// `None` for a primary.
    pub primary: Option<ShardId>,
    pub item_count: u64,
    pub size_bytes: u64,
    pub healthy: bool,
    pub replicas: Vec<NodeId>,
    pub rebalance: RebalanceState,
}

/// Cluster-wide counts returned by [`ShardCoordinator::get_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStats {
    /// Every node on the ring, plus departed nodes still named by a record.
    pub nodes: BTreeMap<NodeId, NodeStats>,
    /// Every shard record, sorted by id.
    pub shards: Vec<ShardStats>,
    /// Distinct assigned items.
    pub total_items: usize,
    /// Records that are unhealthy, plus primaries short of replicas.
    pub degraded_shards: usize,
    pub repair_queue_len: usize,
}

impl ShardCoordinator {
    /// Item and shard counts per node and per shard.
    pub async fn get_stats(&self) -> ClusterStats {
        let rf = self.config.placement.replication_factor;
        let mut stats = ClusterStats {
            total_items: self.registry.item_count(),
            repair_queue_len: self.repairs.len(),
            ..Default::default()
        };
        for node in self.ring.read().await.node_ids() {
            stats.nodes.insert(node, NodeStats::default());
        }

        for meta in self.registry.list() {
            let short = meta.is_primary() && meta.replica_node_ids.len() < rf;
            if !meta.healthy || short {
                stats.degraded_shards += 1;
            }

            let node = stats.nodes.entry(meta.node_id.clone()).or_default();
            if meta.is_primary() {
                node.primary_shards += 1;
            } else {
                node.replica_shards += 1;
            }
            node.items += meta.item_count;

            stats.shards.push(ShardStats {
                rebalance: self
                    .registry
                    .rebalance_state(&meta.shard_id)
                    .unwrap_or_default(),
                shard_id: meta.shard_id,
                collection: meta.collection,
                node_id: meta.node_id,
                primary: meta.primary,
                item_count: meta.item_count,
                size_bytes: meta.size_bytes,
                healthy: meta.healthy,
                replicas: meta.replica_node_ids,
            });
        }
        stats
    }
}
