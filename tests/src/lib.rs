//! Shared test harness for Reef integration tests.
//!
//! Provides [`IntegrationCluster`], an N-node in-process cluster: one
//! [`ShardCoordinator`] over per-node [`FaultyStore`]s, and a
//! [`QueryCoordinator`] whose replica searches go through a
//! [`ChaosClient`] that can take nodes down, fail shard records, add
//! latency and drop requests at a seeded random rate.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reef_coord::{CoordError, CoordinatorConfig, ShardCoordinator};
use reef_query::{
    BudgetManager, HybridSearchEngine, LocalReplicaClient, MemoryGraph, MemoryVectors,
    QueryCoordinator, QueryError, QueryInput, QueryRequest, QueryResponse, ReplicaClient,
    SearchOutcome, ShardSearchRequest,
};
use reef_registry::ShardRegistry;
use reef_store::{FaultyStore, MemoryStore, StorePool};
use reef_types::{
    Cid, CollectionId, ItemId, NodeId, PlacementConfig, QueryConfig, QueryScope, QuorumConfig,
    RebalanceConfig, ShardId,
};
use tokio::sync::RwLock;

/// Per-node store capacity.
const MAX_BYTES: u64 = 64 * 1024 * 1024;

// =========================================================================
// Chaos replica client
// =========================================================================

/// Fault injection applied to every replica search.
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    /// Per-search latency range in milliseconds (min, max).
    pub latency_ms: (u64, u64),
    /// Probability of failing a search (0.0 = never, 1.0 = always).
    pub failure_rate: f64,
    /// Deterministic RNG seed for reproducibility.
    pub seed: u64,
}

/// Delivery statistics from the chaos layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChaosStats {
    /// Searches handed to the replica.
    pub delivered: u64,
    /// Searches failed by the random failure rate.
    pub dropped: u64,
    /// Searches refused because the node or shard was marked down.
    pub blocked: u64,
}

/// [`ReplicaClient`] that applies faults before delegating to a
/// [`LocalReplicaClient`].
pub struct ChaosClient {
    inner: LocalReplicaClient,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    down_nodes: RwLock<HashSet<NodeId>>,
    failing_shards: RwLock<HashSet<ShardId>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    blocked: AtomicU64,
}

impl ChaosClient {
    pub fn new(config: ChaosConfig) -> Self {
        Self {
            inner: LocalReplicaClient::new(),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config,
            down_nodes: RwLock::new(HashSet::new()),
            failing_shards: RwLock::new(HashSet::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Searches on `node` fail as unreachable.
    pub async fn kill_node(&self, node: &NodeId) {
        self.down_nodes.write().await.insert(node.clone());
    }

    pub async fn revive_node(&self, node: &NodeId) {
        self.down_nodes.write().await.remove(node);
    }

    /// Searches against these shard records fail with a backend error.
    pub async fn fail_shards(&self, shards: impl IntoIterator<Item = ShardId>) {
        self.failing_shards.write().await.extend(shards);
    }

    pub async fn heal_shards(&self) {
        self.failing_shards.write().await.clear();
    }

    pub fn stats(&self) -> ChaosStats {
        ChaosStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }

    /// Roll the latency and failure dice for one search.
    fn roll(&self) -> (u64, bool) {
        let mut rng = self.rng.lock().unwrap();
        let (min, max) = self.config.latency_ms;
        let latency = if max == 0 {
            0
        } else if min == max {
            min
        } else {
            rng.random_range(min..=max)
        };
        let drop = self.config.failure_rate > 0.0 && rng.random::<f64>() < self.config.failure_rate;
        (latency, drop)
    }
}

#[async_trait]
impl ReplicaClient for ChaosClient {
    async fn search(
        &self,
        node: &NodeId,
        request: &ShardSearchRequest,
        budget: &BudgetManager,
    ) -> Result<SearchOutcome, QueryError> {
        if self.down_nodes.read().await.contains(node) {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            return Err(QueryError::ReplicaUnreachable(node.clone()));
        }
        if self.failing_shards.read().await.contains(&request.shard_id) {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            return Err(QueryError::Backend(format!(
                "chaos: shard {} failing",
                request.shard_id
            )));
        }

        let (latency, drop) = self.roll();
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if drop {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(QueryError::Backend("chaos: dropped".into()));
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.inner.search(node, request, budget).await
    }
}

// =========================================================================
// IntegrationCluster
// =========================================================================

/// Shape of an [`IntegrationCluster`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub nodes: usize,
    pub replication_factor: usize,
    pub read_quorum: usize,
    pub write_quorum: usize,
    pub shard_size: u64,
    pub query: QueryConfig,
    pub chaos: ChaosConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            replication_factor: 3,
            read_quorum: 1,
            write_quorum: 3,
            shard_size: 100,
            query: QueryConfig::default(),
            chaos: ChaosConfig::default(),
        }
    }
}

impl ClusterConfig {
    fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            placement: PlacementConfig {
                replication_factor: self.replication_factor,
                ..Default::default()
            },
            rebalance: RebalanceConfig {
                shard_size: self.shard_size,
                retry_backoff_ms: 1,
                ..Default::default()
            },
            quorum: QuorumConfig {
                read_quorum: self.read_quorum,
                write_quorum: self.write_quorum,
            },
        }
    }
}

/// A simulated N-node cluster for integration tests.
///
/// Node `i` is named by the `i`-th capital letter (`A`, `B`, ...). All nodes
/// share the vector and graph backends; each has its own store.
pub struct IntegrationCluster {
    config: ClusterConfig,
    coord: Arc<ShardCoordinator>,
    queries: QueryCoordinator,
    chaos: Arc<ChaosClient>,
    vectors: Arc<MemoryVectors>,
    graph: Arc<MemoryGraph>,
    stores: Mutex<BTreeMap<NodeId, Arc<FaultyStore>>>,
}

impl IntegrationCluster {
    pub async fn new(config: ClusterConfig) -> Self {
        let coord = Arc::new(ShardCoordinator::new(
            config.coordinator(),
            Arc::new(ShardRegistry::new()),
            Arc::new(StorePool::new()),
        ));
        let chaos = Arc::new(ChaosClient::new(config.chaos.clone()));
        let queries = QueryCoordinator::new(coord.clone(), chaos.clone(), config.query.clone());
        let cluster = Self {
            coord,
            queries,
            chaos,
            vectors: Arc::new(MemoryVectors::new()),
            graph: Arc::new(MemoryGraph::new()),
            stores: Mutex::new(BTreeMap::new()),
            config,
        };
        for i in 0..cluster.config.nodes {
            cluster.join(node_name(i)).await;
        }
        cluster
    }

    /// Same registry, stores and backends under a coordinator built with a
    /// different `shard_size`, as after a restart with a new config.
    pub async fn reconfigured(&self, shard_size: u64) -> Self {
        let config = ClusterConfig {
            shard_size,
            ..self.config.clone()
        };
        let coord = Arc::new(ShardCoordinator::new(
            config.coordinator(),
            self.coord.registry().clone(),
            self.coord.stores().clone(),
        ));
        for node in self.coord.nodes().await {
            coord.add_node(node).await;
        }
        let queries = QueryCoordinator::new(coord.clone(), self.chaos.clone(), config.query.clone());
        Self {
            coord,
            queries,
            chaos: self.chaos.clone(),
            vectors: self.vectors.clone(),
            graph: self.graph.clone(),
            stores: Mutex::new(self.stores.lock().unwrap().clone()),
            config,
        }
    }

    async fn join(&self, node: NodeId) {
        let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new(MAX_BYTES))));
        self.coord.stores().insert(node.clone(), store.clone());
        self.stores.lock().unwrap().insert(node.clone(), store);
        self.chaos.inner.insert(
            node.clone(),
            Arc::new(HybridSearchEngine::new(
                self.vectors.clone(),
                self.graph.clone(),
                self.config.query.alpha,
            )),
        );
        self.coord.add_node(node).await;
    }

    pub fn coord(&self) -> &Arc<ShardCoordinator> {
        &self.coord
    }

    pub fn chaos(&self) -> &ChaosClient {
        &self.chaos
    }

    pub fn graph(&self) -> &MemoryGraph {
        &self.graph
    }

    /// Fault switches of `node`'s store.
    pub fn store(&self, node: &NodeId) -> Arc<FaultyStore> {
        self.stores.lock().unwrap()[node].clone()
    }

    /// Node ids currently on the ring.
    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.coord.nodes().await
    }

    /// Add the next lettered node and return its id.
    pub async fn add_node(&self) -> NodeId {
        let next = self.stores.lock().unwrap().len();
        let node = node_name(next);
        self.join(node.clone()).await;
        node
    }

    /// Remove `node` from the ring and the query path.
    pub async fn remove_node(&self, node: &NodeId) -> Result<(), CoordError> {
        self.coord.remove_node(node).await?;
        self.chaos.inner.remove(node);
        Ok(())
    }

    /// Assign `doc-{i}` with a vector that drifts from `[1, 0]` as `i` grows.
    pub async fn assign_doc(&self, i: usize) -> Result<Vec<ShardId>, CoordError> {
        let id = doc(i);
        self.vectors.insert(id.clone(), vec![1.0, i as f32 / 10.0]);
        self.coord
            .assign_shards(&collection(), &id, Cid::from_data(id.as_str().as_bytes()))
            .await
    }

    /// Assign every doc in `range`, panicking on failure.
    pub async fn load_docs(&self, range: Range<usize>) {
        for i in range {
            self.assign_doc(i)
                .await
                .unwrap_or_else(|e| panic!("assign doc-{i}: {e}"));
        }
    }

    /// Link `doc-{i} -> doc-{i+1}` for every `i` in `range`.
    pub fn link_chain(&self, range: Range<usize>) {
        for i in range {
            self.graph.link(doc(i), "next", doc(i + 1));
        }
    }

    /// Fail every member of the set holding `item`.
    pub async fn fail_set_of(&self, item: &ItemId) -> ShardId {
        let primary = self.coord.find_shard(item).unwrap();
        let members = self.coord.registry().set_members(&primary).unwrap();
        self.chaos
            .fail_shards(members.into_iter().map(|m| m.shard_id))
            .await;
        primary
    }

    pub async fn execute(&self, request: QueryRequest) -> Result<QueryResponse, QueryError> {
        self.queries.execute(request).await
    }
}

/// Name of node `i`: `A`, `B`, ...
pub fn node_name(i: usize) -> NodeId {
    let letter = char::from(b'A' + u8::try_from(i).expect("at most 26 nodes"));
    NodeId::new(letter.to_string())
}

pub fn doc(i: usize) -> ItemId {
    ItemId::new(format!("doc-{i}"))
}

pub fn collection() -> CollectionId {
    CollectionId::from("docs")
}

/// Vector query for `[1, 0]` over the whole collection.
pub fn collection_query(top_k: usize) -> QueryRequest {
    QueryRequest::new(
        QueryInput::Embedding(vec![1.0, 0.0]),
        QueryScope::Collection(collection()),
        top_k,
    )
}
