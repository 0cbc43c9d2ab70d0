//! Per-node store lookup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use reef_types::NodeId;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::DurableStore;

/// Maps each cluster node to the durable store holding its shard payloads.
#[derive(Default)]
pub struct StorePool {
    stores: RwLock<HashMap<NodeId, Arc<dyn DurableStore>>>,
}

impl StorePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the store for `node_id`.
    pub fn insert(&self, node_id: NodeId, store: Arc<dyn DurableStore>) {
        debug!(%node_id, "registered node store");
        self.stores
            .write()
            .expect("lock poisoned")
            .insert(node_id, store);
    }

    /// Forget the store for `node_id`.
    pub fn remove(&self, node_id: &NodeId) -> Option<Arc<dyn DurableStore>> {
        self.stores.write().expect("lock poisoned").remove(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.stores.read().expect("lock poisoned").contains_key(node_id)
    }

    /// The store for `node_id`, or [`StoreError::NoStore`].
    pub fn get(&self, node_id: &NodeId) -> Result<Arc<dyn DurableStore>, StoreError> {
        self.stores
            .read()
            .expect("lock poisoned")
            .get(node_id)
            .cloned()
            .ok_or_else(|| StoreError::NoStore(node_id.clone()))
    }
}
