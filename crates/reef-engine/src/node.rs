//! [`ReefNode`]: one process hosting every node of an in-process cluster.

use std::sync::Arc;

use reef_coord::{ClusterStats, RebalanceReport, RepairReport, ShardCoordinator};
use reef_meta::MetaStore;
use reef_query::{
    EmbeddingProvider, GraphBackend, HybridSearchEngine, LocalReplicaClient, QueryCoordinator,
    QueryRequest, QueryResponse, VectorBackend,
};
use reef_registry::ShardRegistry;
use reef_store::{MemoryStore, StorePool};
use reef_types::{Cid, ClusterEvent, CollectionId, ItemId, NodeId, ShardId};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::ReefConfig;
use crate::engine::ReefEngine;
use crate::error::EngineError;

/// External collaborators a node searches with.
#[derive(Clone)]
pub struct Backends {
    pub vectors: Arc<dyn VectorBackend>,
    pub graph: Arc<dyn GraphBackend>,
    /// Without a provider, text queries are scored graph-only.
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
}

/// Coordinator, query path and per-node stores wired from one config.
pub struct ReefNode {
    config: ReefConfig,
    coord: Arc<ShardCoordinator>,
    queries: QueryCoordinator,
    client: Arc<LocalReplicaClient>,
    backends: Backends,
}

impl ReefNode {
    /// Build a node from a validated config.
    ///
    /// With `storage.meta_dir` set, registry state and the repair queue are
    /// reloaded from (and written through to) the fjall database there.
    pub fn new(config: ReefConfig, backends: Backends) -> Result<Self, EngineError> {
        config.validate()?;

        let meta = match &config.storage.meta_dir {
            Some(dir) => Some(Arc::new(MetaStore::open(dir)?)),
            None => None,
        };
        let registry = match &meta {
            Some(meta) => ShardRegistry::load(meta.clone())?,
            None => ShardRegistry::new(),
        };
        let mut coord = ShardCoordinator::new(
            config.coordinator(),
            Arc::new(registry),
            Arc::new(StorePool::new()),
        );
        if let Some(meta) = meta {
            coord = coord.with_meta(meta)?;
        }
        let coord = Arc::new(coord);

        let client = Arc::new(LocalReplicaClient::new());
        let mut queries = QueryCoordinator::new(coord.clone(), client.clone(), config.query.clone());
        if let Some(embedder) = &backends.embedder {
            queries = queries.with_embedder(embedder.clone());
        }

        info!(
            replication_factor = config.placement.replication_factor,
            shard_size = config.rebalance.shard_size,
            persistent = config.storage.meta_dir.is_some(),
            "reef node ready"
        );
        Ok(Self {
            config,
            coord,
            queries,
            client,
            backends,
        })
    }

    pub fn config(&self) -> &ReefConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ShardCoordinator> {
        &self.coord
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.coord.subscribe()
    }

    /// Run one split/merge pass.
    pub async fn rebalance(&self) -> RebalanceReport {
        self.coord.rebalance().await
    }

    /// Drain the repair queue.
    pub async fn repair(&self) -> RepairReport {
        self.coord.repair().await
    }
}

#[async_trait::async_trait]
impl ReefEngine for ReefNode {
    async fn add_node(&self, node_id: NodeId) -> Result<(), EngineError> {
        let stores = self.coord.stores();
        if !stores.contains(&node_id) {
            stores.insert(
                node_id.clone(),
                Arc::new(MemoryStore::new(self.config.storage.max_bytes_per_node)),
            );
        }
        self.client.insert(
            node_id.clone(),
            Arc::new(HybridSearchEngine::new(
                self.backends.vectors.clone(),
                self.backends.graph.clone(),
                self.config.query.alpha,
            )),
        );
        self.coord.add_node(node_id).await;
        Ok(())
    }

    async fn remove_node(&self, node_id: &NodeId) -> Result<(), EngineError> {
        self.coord.remove_node(node_id).await?;
        self.client.remove(node_id);
        self.coord.stores().remove(node_id);
        Ok(())
    }

    async fn assign_item(
        &self,
        collection: &CollectionId,
        item_id: &ItemId,
        item_cid: Cid,
    ) -> Result<Vec<ShardId>, EngineError> {
        Ok(self.coord.assign_shards(collection, item_id, item_cid).await?)
    }

    async fn execute(&self, request: QueryRequest) -> Result<QueryResponse, EngineError> {
        Ok(self.queries.execute(request).await?)
    }

    async fn get_stats(&self) -> Result<ClusterStats, EngineError> {
        Ok(self.coord.get_stats().await)
    }
}
