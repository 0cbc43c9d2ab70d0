//! Consistent hashing ring for deterministic shard placement.
//!
//! Every physical node gets `virtual_nodes_per_node` positions on a u64
//! ring at `blake3(node_id ++ index)`. A key is placed by hashing it onto
//! the ring and walking clockwise, collecting distinct physical nodes.
//! Adding or removing one node only remaps the keys adjacent to that
//! node's positions.

mod error;
mod ring;

pub use error::PlacementError;
pub use ring::HashRing;
