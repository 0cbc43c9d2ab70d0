//! Transport seam between the query coordinator and shard replicas.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reef_types::{CollectionId, ItemId, NodeId, ShardId};

use crate::backend::Embedding;
use crate::budget::BudgetManager;
use crate::engine::{HybridSearchEngine, SearchOutcome};
use crate::error::QueryError;

/// One shard search sent to one replica.
#[derive(Debug, Clone)]
pub struct ShardSearchRequest {
    /// The replica's own shard record.
    pub shard_id: ShardId,
    pub collection: CollectionId,
    /// `None` when the query runs graph-only.
    pub query: Option<Arc<Embedding>>,
    pub seeds: Vec<ItemId>,
}

/// Runs shard searches on the node hosting a replica.
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    async fn search(
        &self,
        node: &NodeId,
        request: &ShardSearchRequest,
        budget: &BudgetManager,
    ) -> Result<SearchOutcome, QueryError>;
}

/// In-process client: each node maps to a local [`HybridSearchEngine`].
#[derive(Default)]
pub struct LocalReplicaClient {
    engines: RwLock<HashMap<NodeId, Arc<HybridSearchEngine>>>,
}

impl LocalReplicaClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: NodeId, engine: Arc<HybridSearchEngine>) {
        self.engines
            .write()
            .expect("client lock poisoned")
            .insert(node, engine);
    }

    pub fn remove(&self, node: &NodeId) -> Option<Arc<HybridSearchEngine>> {
        self.engines
            .write()
            .expect("client lock poisoned")
            .remove(node)
    }
}

#[async_trait]
impl ReplicaClient for LocalReplicaClient {
    async fn search(
        &self,
        node: &NodeId,
        request: &ShardSearchRequest,
        budget: &BudgetManager,
    ) -> Result<SearchOutcome, QueryError> {
        let engine = self
            .engines
            .read()
            .expect("client lock poisoned")
            .get(node)
            .cloned()
            .ok_or_else(|| QueryError::ReplicaUnreachable(node.clone()))?;
        engine
            .search(request.query.as_deref().map(Vec::as_slice), &request.seeds, budget)
            .await
    }
}
