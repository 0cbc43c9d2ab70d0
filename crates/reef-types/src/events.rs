//! Cluster events broadcast by the shard coordinator.
//!
//! Subscribers (repair loops, tests, operators' tooling) receive these over
//! a `tokio::sync::broadcast` channel owned by the coordinator.

use serde::{Deserialize, Serialize};

use crate::{NodeId, ShardId};

/// Structural changes to placement and shard ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// A node was added to the hash ring.
    NodeJoined(NodeId),
    /// A node was removed from the hash ring.
    NodeLeft(NodeId),
    /// A shard set lost a replica and was queued for repair.
    ShardDegraded {
        primary: ShardId,
        surviving_replicas: usize,
    },
    /// A replica took over as primary after its owner left.
    ReplicaPromoted {
        previous: ShardId,
        promoted: ShardId,
    },
    /// A replacement replica was copied and registered.
    ReplicaRepaired { primary: ShardId, replica: ShardId },
    /// A shard set was split; `created` is the new primary.
    ShardSplit { source: ShardId, created: ShardId },
    /// A shard set was folded into `target`.
    ShardMerged { source: ShardId, target: ShardId },
    /// A migration failed verification and left the registry untouched.
    MigrationAborted { shard_id: ShardId, reason: String },
}
