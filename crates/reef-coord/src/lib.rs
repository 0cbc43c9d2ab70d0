//! Shard coordination for Reef.
//!
//! [`ShardCoordinator`] is the public placement API. It combines the
//! [`HashRing`](reef_placement::HashRing), the
//! [`ShardRegistry`](reef_registry::ShardRegistry) and the per-node
//! [`StorePool`](reef_store::StorePool):
//!
//! - membership: [`add_node`](ShardCoordinator::add_node) and
//!   [`remove_node`](ShardCoordinator::remove_node), which promotes surviving
//!   replicas and queues degraded sets for repair
//! - writes: [`assign_shards`](ShardCoordinator::assign_shards), idempotent on
//!   the item id and acknowledged by a write quorum
//! - maintenance: [`rebalance`](ShardCoordinator::rebalance) (split / merge
//!   migrations) and [`repair`](ShardCoordinator::repair)
//! - observation: [`get_stats`](ShardCoordinator::get_stats) and the
//!   [`ClusterEvent`](reef_types::ClusterEvent) broadcast channel

mod coordinator;
mod error;
mod rebalance;
mod repair;
mod stats;
mod transfer;

pub use coordinator::{CoordinatorConfig, ReplicaTarget, ShardCoordinator, ShardTarget};
pub use error::CoordError;
pub use rebalance::RebalanceReport;
pub use repair::RepairReport;
pub use stats::{ClusterStats, NodeStats, ShardStats};
