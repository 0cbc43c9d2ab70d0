//! Tunables shared by placement, rebalancing, quorum and query execution.
//!
//! Every section deserializes with `#[serde(default)]` so partial TOML files
//! only override what they mention.

use serde::{Deserialize, Serialize};

/// Consistent-hash placement parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Virtual positions per physical node on the ring.
    pub virtual_nodes_per_node: u16,
    /// Number of distinct nodes holding each shard set.
    pub replication_factor: usize,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            virtual_nodes_per_node: 150,
            replication_factor: 3,
        }
    }
}

/// Split/merge thresholds and migration retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Target number of items per shard.
    pub shard_size: u64,
    /// A shard splits above `split_factor * shard_size` items.
    pub split_factor: f64,
    /// A shard merges below `merge_factor * shard_size` items.
    pub merge_factor: f64,
    /// Flip attempts before a conflicting migration gives up.
    pub max_retries: u32,
    /// Base delay for exponential backoff between flip attempts.
    pub retry_backoff_ms: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            shard_size: 100_000,
            split_factor: 1.5,
            merge_factor: 0.3,
            max_retries: 3,
            retry_backoff_ms: 10,
        }
    }
}

impl RebalanceConfig {
    /// Item count above which a shard is split.
    pub fn split_threshold(&self) -> u64 {
        (self.shard_size as f64 * self.split_factor) as u64
    }

    /// Item count below which a shard looks for a merge sibling.
    pub fn merge_threshold(&self) -> u64 {
        (self.shard_size as f64 * self.merge_factor) as u64
    }
}

/// Read and write quorum sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Replicas that must answer a shard query.
    pub read_quorum: usize,
    /// Replicas that must acknowledge a write or migration copy.
    pub write_quorum: usize,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            read_quorum: 1,
            write_quorum: 3,
        }
    }
}

/// Query execution tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Weight of vector similarity against graph proximity.
    pub alpha: f32,
    /// Maximum shards searched concurrently.
    pub fan_out_limit: usize,
    /// Fraction of the remaining time held back for the final merge.
    pub merge_reserve: f64,
    /// Capacity of the text-to-embedding LRU cache.
    pub embedding_cache_entries: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            fan_out_limit: 8,
            merge_reserve: 0.1,
            embedding_cache_entries: 1024,
        }
    }
}
