//! Hash ring with virtual nodes.

use std::collections::BTreeMap;

use reef_types::NodeId;
use tracing::debug;

use crate::PlacementError;

/// Consistent hash ring.
///
/// `positions` maps ring positions to physical nodes; `nodes` remembers the
/// exact positions each node inserted so removal never touches another
/// node's entries, even on a hash collision.
#[derive(Debug, Clone)]
pub struct HashRing {
    positions: BTreeMap<u64, NodeId>,
    nodes: BTreeMap<NodeId, Vec<u64>>,
    virtual_nodes_per_node: u16,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new(virtual_nodes_per_node: u16) -> Self {
        Self {
            positions: BTreeMap::new(),
            nodes: BTreeMap::new(),
            virtual_nodes_per_node: virtual_nodes_per_node.max(1),
        }
    }

    /// Insert a node's virtual positions. Re-adding a present node is a no-op.
    pub fn add_node(&mut self, node_id: NodeId) {
        if self.nodes.contains_key(&node_id) {
            return;
        }

        let mut owned = Vec::with_capacity(self.virtual_nodes_per_node as usize);
        for index in 0..self.virtual_nodes_per_node {
            let pos = vnode_position(&node_id, index);
            // First writer keeps a colliding position.
            if !self.positions.contains_key(&pos) {
                self.positions.insert(pos, node_id.clone());
                owned.push(pos);
            }
        }

        debug!(%node_id, vnodes = owned.len(), "added node to ring");
        self.nodes.insert(node_id, owned);
    }

    /// Remove exactly the positions `node_id` inserted.
    ///
    /// Returns whether the node was present.
    pub fn remove_node(&mut self, node_id: &NodeId) -> bool {
        let Some(owned) = self.nodes.remove(node_id) else {
            return false;
        };
        for pos in owned {
            self.positions.remove(&pos);
        }
        debug!(%node_id, "removed node from ring");
        true
    }

    /// Up to `count` distinct nodes for `key`, in clockwise order from the
    /// key's ring position.
    ///
    /// Fewer than `count` nodes are returned only when the ring holds fewer
    /// physical nodes.
    pub fn locate(&self, key: impl AsRef<[u8]>, count: usize) -> Result<Vec<NodeId>, PlacementError> {
        if self.positions.is_empty() {
            return Err(PlacementError::NoNodesAvailable);
        }

        let pos = key_position(key.as_ref());
        let wanted = count.min(self.nodes.len());
        let mut found: Vec<NodeId> = Vec::with_capacity(wanted);

        // Everything >= pos, then wrap around to the start.
        for (_, node_id) in self.positions.range(pos..).chain(self.positions.range(..pos)) {
            if found.len() == wanted {
                break;
            }
            if !found.contains(node_id) {
                found.push(node_id.clone());
            }
        }

        Ok(found)
    }

    /// Whether `node_id` currently has positions on the ring.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Number of physical nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of virtual positions.
    pub fn vnode_count(&self) -> usize {
        self.positions.len()
    }

    /// Physical node ids in sorted order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }
}

/// `blake3(node_id ++ index)` truncated to u64.
fn vnode_position(node_id: &NodeId, index: u16) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(node_id.as_ref());
    hasher.update(&index.to_le_bytes());
    truncate(hasher.finalize())
}

fn key_position(key: &[u8]) -> u64 {
    truncate(blake3::hash(key))
}

fn truncate(hash: blake3::Hash) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
