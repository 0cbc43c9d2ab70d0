//! [`ShardCoordinator`]: membership, placement and the replicated write path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reef_meta::MetaStore;
use reef_placement::HashRing;
use reef_registry::{ShardRecord, ShardRegistry};
use reef_store::StorePool;
use reef_types::{
    Cid, ClusterEvent, CollectionId, ItemId, NodeId, PlacementConfig, QueryScope, QuorumConfig,
    RebalanceConfig, ShardId, ShardMetadata, ShardPayload,
};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, error, info, warn};

use crate::error::CoordError;
use crate::repair::RepairQueue;

type Result<T> = std::result::Result<T, CoordError>;

/// Placement, rebalancing and quorum settings for a coordinator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorConfig {
    pub placement: PlacementConfig,
    pub rebalance: RebalanceConfig,
    pub quorum: QuorumConfig,
}

/// One member of a shard set a query may read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTarget {
    pub shard_id: ShardId,
    pub node_id: NodeId,
}

/// A shard set a query fans out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTarget {
    pub primary: ShardId,
    pub collection: CollectionId,
    /// Healthy members in placement order, primary first.
    pub replicas: Vec<ReplicaTarget>,
    /// Items the search starts from.
    pub seeds: Vec<ItemId>,
}

/// Public placement API over the ring, the registry and the node stores.
pub struct ShardCoordinator {
    pub(crate) config: CoordinatorConfig,
    pub(crate) ring: RwLock<HashRing>,
    pub(crate) registry: Arc<ShardRegistry>,
    pub(crate) stores: Arc<StorePool>,
    pub(crate) repairs: RepairQueue,
    /// Serializes item writes so payload snapshots are not interleaved.
    pub(crate) write_lock: Mutex<()>,
    /// Only one rebalance pass runs at a time.
    pub(crate) rebalance_lock: Mutex<()>,
    event_tx: broadcast::Sender<ClusterEvent>,
}

impl ShardCoordinator {
    /// Create a coordinator with an empty ring.
    pub fn new(config: CoordinatorConfig, registry: Arc<ShardRegistry>, stores: Arc<StorePool>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            ring: RwLock::new(HashRing::new(config.placement.virtual_nodes_per_node)),
            config,
            registry,
            stores,
            repairs: RepairQueue::default(),
            write_lock: Mutex::new(()),
            rebalance_lock: Mutex::new(()),
            event_tx,
        }
    }

    /// Persist the repair queue in `meta`, reloading entries left by a
    /// previous run.
    pub fn with_meta(mut self, meta: Arc<MetaStore>) -> Result<Self> {
        self.repairs = RepairQueue::persistent(meta)?;
        Ok(self)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn stores(&self) -> &Arc<StorePool> {
        &self.stores
    }

    /// Subscribe to cluster events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.event_tx.subscribe()
    }

    /// Node ids currently on the ring.
    pub async fn nodes(&self) -> Vec<NodeId> {
        self.ring.read().await.node_ids()
    }

    pub(crate) fn emit(&self, event: ClusterEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    // ----- Membership -----

    /// Register a node on the ring.
    ///
    /// Existing items are not migrated. Sets that are still short of
    /// replicas are queued for repair, since the new node may host one.
    pub async fn add_node(&self, node_id: NodeId) {
        {
            let mut ring = self.ring.write().await;
            if ring.contains(&node_id) {
                debug!(%node_id, "node already on ring");
                return;
            }
            ring.add_node(node_id.clone());
        }
        info!(%node_id, "node joined");
        self.emit(ClusterEvent::NodeJoined(node_id));

        let rf = self.config.placement.replication_factor;
        for primary in self.registry.primaries(None) {
            if primary.replica_node_ids.len() < rf {
                let surviving = self.healthy_members(&primary.shard_id);
                self.repairs.enqueue(&primary.shard_id, surviving);
            }
        }
    }

    /// Remove a node from the ring and detach it from every shard set.
    ///
    /// Records it hosted are marked unhealthy. Where it owned the primary,
    /// the first surviving replica is promoted. Each affected set is queued
    /// for repair, fewest survivors first.
    pub async fn remove_node(&self, node_id: &NodeId) -> Result<()> {
        let was_present = self.ring.write().await.remove_node(node_id);
        if was_present {
            info!(%node_id, "node left");
            self.emit(ClusterEvent::NodeLeft(node_id.clone()));
        }

        let affected: BTreeSet<ShardId> = self
            .registry
            .list()
            .into_iter()
            .filter(|m| m.involves(node_id))
            .map(|m| m.primary_id().clone())
            .collect();

        for primary in affected {
            let outcome = match self.registry.detach_node(&primary, node_id) {
                Ok(outcome) => outcome,
                // Merged away since the scan.
                Err(reef_registry::RegistryError::ShardNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            if let Some(promoted) = &outcome.promoted {
                self.emit(ClusterEvent::ReplicaPromoted {
                    previous: primary.clone(),
                    promoted: promoted.clone(),
                });
            }
            if outcome.is_lost() {
                error!(%primary, %node_id, "no healthy replica survived, shard set unavailable");
                continue;
            }
            self.emit(ClusterEvent::ShardDegraded {
                primary: outcome.primary.clone(),
                surviving_replicas: outcome.surviving,
            });
            self.repairs.enqueue(&outcome.primary, outcome.surviving);
        }
        Ok(())
    }

    // ----- Placement -----

    /// Place an item and return its shard set, primary first.
    ///
    /// Idempotent on `item_id`: an assigned item keeps its set (its content
    /// is rewritten if `item_cid` changed). A new item goes to a reusable set
    /// on the ring placement with room left, or to a freshly created set.
    /// The write is durable once `write_quorum` members acknowledged it;
    /// otherwise it fails with [`CoordError::QuorumNotReached`] and the
    /// registry is unchanged.
    #[tracing::instrument(skip_all, fields(%collection, %item_id))]
    pub async fn assign_shards(
        &self,
        collection: &CollectionId,
        item_id: &ItemId,
        item_cid: Cid,
    ) -> Result<Vec<ShardId>> {
        let _guard = self.write_lock.lock().await;
        let mut attempt = 0;
        loop {
            match self.try_assign(collection, item_id, item_cid).await {
                Err(e) if e.is_conflict() && attempt < self.config.rebalance.max_retries => {
                    debug!(attempt, error = %e, "write raced a concurrent change, retrying");
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_assign(
        &self,
        collection: &CollectionId,
        item_id: &ItemId,
        item_cid: Cid,
    ) -> Result<Vec<ShardId>> {
        if let Ok(primary) = self.registry.find_shard(item_id) {
            let record = self.registry.record(&primary)?;
            if record.payload.items.get(item_id) != Some(&item_cid) {
                self.write_to_set(&primary, item_id, item_cid).await?;
            }
            return self.member_ids(&primary);
        }

        let placement = self
            .ring
            .read()
            .await
            .locate(item_id, self.config.placement.replication_factor)?;

        let capacity = self.config.rebalance.shard_size;
        match self.registry.find_reusable_set(collection, &placement, capacity) {
            Some(primary) => {
                self.write_to_set(&primary, item_id, item_cid).await?;
                self.member_ids(&primary)
            }
            None => self.create_set(collection, placement, item_id, item_cid).await,
        }
    }

    /// Create a new set on `placement` holding just `item_id`.
    async fn create_set(
        &self,
        collection: &CollectionId,
        placement: Vec<NodeId>,
        item_id: &ItemId,
        item_cid: Cid,
    ) -> Result<Vec<ShardId>> {
        let mut payload = ShardPayload::new(collection.clone());
        payload.items.insert(item_id.clone(), item_cid);
        let bytes = Bytes::from(payload.encode()?);
        let root = Cid::from_data(&bytes);

        let targets: Vec<(NodeId, ShardId)> = placement
            .iter()
            .map(|node| (node.clone(), self.registry.next_shard_id(collection, node)))
            .collect();
        let primary = targets[0].1.clone();

        let acks = self.put_all(&targets, &bytes, root).await;
        let acked: BTreeSet<ShardId> = acks.into_iter().collect();
        let required = self.config.quorum.write_quorum;
        if acked.len() < required {
            self.discard(&targets, &acked, root).await;
            warn!(%primary, acked = acked.len(), required, "write quorum not reached for new set");
            return Err(CoordError::QuorumNotReached {
                shard_id: primary,
                acked: acked.len(),
                required,
            });
        }

        let mut records = Vec::with_capacity(targets.len());
        for (node, shard_id) in &targets {
            let mut meta = ShardMetadata::new(
                shard_id.clone(),
                collection.clone(),
                node.clone(),
                (shard_id != &primary).then(|| primary.clone()),
                placement.clone(),
            );
            meta.healthy = acked.contains(shard_id);
            records.push(ShardRecord::new(meta, payload.clone())?);
        }
        self.registry.insert_set(records)?;

        if acked.len() < targets.len() || placement.len() < self.config.placement.replication_factor {
            self.repairs.enqueue(&primary, acked.len());
        }
        debug!(%primary, members = targets.len(), "created shard set");
        Ok(targets.into_iter().map(|(_, id)| id).collect())
    }

    /// Write `item_id` into every live member of an existing set.
    async fn write_to_set(&self, primary: &ShardId, item_id: &ItemId, item_cid: Cid) -> Result<()> {
        let members = self.registry.set_members(primary)?;
        let placement = members
            .first()
            .map(|m| m.replica_node_ids.clone())
            .unwrap_or_default();
        let expected: BTreeMap<ShardId, Cid> = members
            .iter()
            .map(|m| (m.shard_id.clone(), m.root_cid))
            .collect();

        let mut payload = self.registry.record(primary)?.payload;
        payload.items.insert(item_id.clone(), item_cid);
        let bytes = Bytes::from(payload.encode()?);
        let root = Cid::from_data(&bytes);

        let live: Vec<&ShardMetadata> = members
            .iter()
            .filter(|m| placement.contains(&m.node_id))
            .collect();
        let targets: Vec<(NodeId, ShardId)> = live
            .iter()
            .map(|m| (m.node_id.clone(), m.shard_id.clone()))
            .collect();

        let acked: BTreeSet<ShardId> = self.put_all(&targets, &bytes, root).await.into_iter().collect();
        let required = self.config.quorum.write_quorum;
        if acked.len() < required {
            self.discard(&targets, &acked, root).await;
            warn!(%primary, acked = acked.len(), required, "write quorum not reached");
            return Err(CoordError::QuorumNotReached {
                shard_id: primary.clone(),
                acked: acked.len(),
                required,
            });
        }

        let degraded: BTreeSet<ShardId> = targets
            .iter()
            .map(|(_, id)| id.clone())
            .filter(|id| !acked.contains(id))
            .collect();
        if let Err(e) = self
            .registry
            .commit_item(primary, item_id, item_cid, &expected, &degraded)
        {
            self.discard(&targets, &acked, root).await;
            return Err(e.into());
        }

        // Superseded payloads. Degraded members are re-copied by repair.
        for member in &live {
            if member.root_cid != root {
                self.delete_blob(&member.node_id, &member.shard_id, member.root_cid).await;
            }
        }

        if !degraded.is_empty() {
            warn!(%primary, failed = degraded.len(), "replicas missed a write, queued for repair");
            self.repairs.enqueue(primary, acked.len());
        }
        Ok(())
    }

    /// Store `bytes` for every `(node, shard)` target concurrently and return
    /// the shards whose store acknowledged the expected CID.
    async fn put_all(&self, targets: &[(NodeId, ShardId)], bytes: &Bytes, root: Cid) -> Vec<ShardId> {
        let puts = targets.iter().map(|(node, shard_id)| {
            let bytes = bytes.clone();
            async move {
                match self.put_verified(node, shard_id, bytes, root, false).await {
                    Ok(()) => Some(shard_id.clone()),
                    Err(e) => {
                        warn!(%node, %shard_id, error = %e, "replica write failed");
                        None
                    }
                }
            }
        });
        futures::future::join_all(puts).await.into_iter().flatten().collect()
    }

    /// Drop blobs written for an aborted write.
    async fn discard(&self, targets: &[(NodeId, ShardId)], acked: &BTreeSet<ShardId>, root: Cid) {
        for (node, shard_id) in targets {
            if acked.contains(shard_id) {
                self.delete_blob(node, shard_id, root).await;
            }
        }
    }

    // ----- Lookups -----

    /// Primary shard of an item.
    pub fn find_shard(&self, item_id: &ItemId) -> Result<ShardId> {
        Ok(self.registry.find_shard(item_id)?)
    }

    /// Full shard set of an item, primary first.
    pub fn locate(&self, item_id: &ItemId) -> Result<Vec<ShardId>> {
        let primary = self.registry.find_shard(item_id)?;
        self.member_ids(&primary)
    }

    /// Shard sets a query must reach, with their readable replicas.
    pub fn query_targets(&self, scope: &QueryScope) -> Result<Vec<ShardTarget>> {
        match scope {
            QueryScope::Collection(collection) => self
                .registry
                .primaries(Some(collection))
                .into_iter()
                .map(|primary| {
                    let seeds = self.registry.item_ids(&primary.shard_id)?;
                    self.target_for(&primary.shard_id, seeds)
                })
                .collect(),
            QueryScope::Item(item_id) => {
                let primary = self.registry.find_shard(item_id)?;
                Ok(vec![self.target_for(&primary, vec![item_id.clone()])?])
            }
        }
    }

    fn target_for(&self, primary: &ShardId, seeds: Vec<ItemId>) -> Result<ShardTarget> {
        let members = self.registry.set_members(primary)?;
        let placement = members
            .first()
            .map(|m| m.replica_node_ids.clone())
            .unwrap_or_default();
        let collection = members
            .first()
            .map(|m| m.collection.clone())
            .ok_or_else(|| reef_registry::RegistryError::ShardNotFound(primary.clone()))?;
        let replicas = members
            .into_iter()
            .filter(|m| m.healthy && placement.contains(&m.node_id))
            .map(|m| ReplicaTarget {
                shard_id: m.shard_id,
                node_id: m.node_id,
            })
            .collect();
        Ok(ShardTarget {
            primary: primary.clone(),
            collection,
            replicas,
            seeds,
        })
    }

    fn member_ids(&self, primary: &ShardId) -> Result<Vec<ShardId>> {
        let placement = self.registry.get(primary)?.replica_node_ids;
        Ok(self
            .registry
            .set_members(primary)?
            .into_iter()
            .filter(|m| placement.contains(&m.node_id))
            .map(|m| m.shard_id)
            .collect())
    }

    /// Healthy members of a set hosted on its placement nodes.
    pub(crate) fn healthy_members(&self, primary: &ShardId) -> usize {
        self.registry
            .set_members(primary)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.healthy && m.replica_node_ids.contains(&m.node_id))
                    .count()
            })
            .unwrap_or(0)
    }

    pub(crate) async fn backoff(&self, attempt: u32) {
        let base = self.config.rebalance.retry_backoff_ms;
        let delay = base.saturating_mul(1u64 << attempt.min(16));
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reef_store::{FaultyStore, MemoryStore};

    use super::*;

    const MB: u64 = 1024 * 1024;

    fn coordinator(rf: usize, write_quorum: usize, shard_size: u64) -> ShardCoordinator {
        let config = CoordinatorConfig {
            placement: PlacementConfig {
                replication_factor: rf,
                ..Default::default()
            },
            rebalance: RebalanceConfig {
                shard_size,
                ..Default::default()
            },
            quorum: QuorumConfig {
                read_quorum: 1,
                write_quorum,
            },
        };
        ShardCoordinator::new(config, Arc::new(ShardRegistry::new()), Arc::new(StorePool::new()))
    }

    async fn with_nodes(coord: &ShardCoordinator, names: &[&str]) {
        for name in names {
            let node = NodeId::from(*name);
            coord.stores.insert(node.clone(), Arc::new(MemoryStore::new(MB)));
            coord.add_node(node).await;
        }
    }

    fn docs() -> CollectionId {
        CollectionId::from("docs")
    }

    fn item(id: &str) -> (ItemId, Cid) {
        (ItemId::from(id), Cid::from_data(id.as_bytes()))
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_assign_returns_rf_distinct_nodes() {
        let coord = coordinator(3, 3, 100);
        with_nodes(&coord, &["A", "B", "C", "D", "E"]).await;

        for i in 0..50 {
            let (id, cid) = item(&format!("doc-{i}"));
            let set = coord.assign_shards(&docs(), &id, cid).await.unwrap();
            assert_eq!(set.len(), 3);
            let nodes: BTreeSet<NodeId> = set
                .iter()
                .map(|s| coord.registry.get(s).unwrap().node_id)
                .collect();
            assert_eq!(nodes.len(), 3, "duplicate node in set for {id}");
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_assign_is_idempotent() {
        let coord = coordinator(3, 3, 100);
        with_nodes(&coord, &["A", "B", "C"]).await;
        let (id, cid) = item("doc-42");

        let first = coord.assign_shards(&docs(), &id, cid).await.unwrap();
        let second = coord.assign_shards(&docs(), &id, cid).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(coord.registry.item_count(), 1);
        assert_eq!(coord.registry.get(&first[0]).unwrap().item_count, 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_assign_reuses_set_with_same_placement() {
        let coord = coordinator(3, 3, 100);
        with_nodes(&coord, &["A", "B", "C"]).await;

        let mut primaries = BTreeSet::new();
        for i in 0..10 {
            let (id, cid) = item(&format!("doc-{i}"));
            let set = coord.assign_shards(&docs(), &id, cid).await.unwrap();
            primaries.insert(set[0].clone());
        }
        // Three nodes and rf=3 give at most 3! orderings of the placement.
        assert!(primaries.len() <= 6);
        let total: u64 = primaries
            .iter()
            .map(|p| coord.registry.get(p).unwrap().item_count)
            .sum();
        assert_eq!(total, 10);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_empty_ring_fails() {
        let coord = coordinator(3, 3, 100);
        let (id, cid) = item("doc-1");
        let err = coord.assign_shards(&docs(), &id, cid).await.unwrap_err();
        assert!(matches!(err, CoordError::Placement(_)));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_quorum_failure_leaves_registry_untouched() {
        let coord = coordinator(3, 3, 100);
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new(MB))));
        coord.stores.insert(NodeId::from("A"), faulty.clone());
        coord.add_node(NodeId::from("A")).await;
        with_nodes(&coord, &["B", "C"]).await;

        faulty.set_fail_writes(true);
        let (id, cid) = item("doc-1");
        let err = coord.assign_shards(&docs(), &id, cid).await.unwrap_err();
        assert!(matches!(err, CoordError::QuorumNotReached { acked: 2, required: 3, .. }));
        assert!(coord.registry.list().is_empty());
        assert!(coord.find_shard(&id).is_err());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_partial_ack_marks_replica_unhealthy() {
        let coord = coordinator(3, 2, 100);
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new(MB))));
        coord.stores.insert(NodeId::from("C"), faulty.clone());
        coord.add_node(NodeId::from("C")).await;
        with_nodes(&coord, &["A", "B"]).await;

        faulty.set_fail_writes(true);
        let (id, cid) = item("doc-1");
        let set = coord.assign_shards(&docs(), &id, cid).await.unwrap();
        let unhealthy: Vec<ShardMetadata> = set
            .iter()
            .map(|s| coord.registry.get(s).unwrap())
            .filter(|m| !m.healthy)
            .collect();
        assert_eq!(unhealthy.len(), 1);
        assert_eq!(unhealthy[0].node_id, NodeId::from("C"));
        assert_eq!(coord.repairs.len(), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_remove_node_promotes_replica() {
        let coord = coordinator(3, 2, 100);
        with_nodes(&coord, &["A", "B", "C"]).await;
        let (id, cid) = item("doc-42");
        let set = coord.assign_shards(&docs(), &id, cid).await.unwrap();
        let owner = coord.registry.get(&set[0]).unwrap().node_id;

        let mut events = coord.subscribe();
        coord.remove_node(&owner).await.unwrap();

        let primary = coord.find_shard(&id).unwrap();
        assert_eq!(primary, set[1]);
        assert!(coord.registry.get(&primary).unwrap().is_primary());
        assert!(!coord.registry.get(&set[0]).unwrap().healthy);

        let mut promoted = false;
        while let Ok(event) = events.try_recv() {
            if let ClusterEvent::ReplicaPromoted { promoted: p, .. } = event {
                assert_eq!(p, set[1]);
                promoted = true;
            }
        }
        assert!(promoted);
        assert_eq!(coord.repairs.len(), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_query_targets_for_item_scope() {
        let coord = coordinator(3, 3, 100);
        with_nodes(&coord, &["A", "B", "C"]).await;
        let (id, cid) = item("doc-42");
        let set = coord.assign_shards(&docs(), &id, cid).await.unwrap();

        let targets = coord.query_targets(&QueryScope::Item(id.clone())).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].primary, set[0]);
        assert_eq!(targets[0].seeds, vec![id]);
        let replica_ids: Vec<ShardId> = targets[0].replicas.iter().map(|r| r.shard_id.clone()).collect();
        assert_eq!(replica_ids, set);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_query_targets_unknown_item() {
        let coord = coordinator(3, 3, 100);
        with_nodes(&coord, &["A", "B", "C"]).await;
        assert!(coord.query_targets(&QueryScope::Item(ItemId::from("ghost"))).is_err());
    }
}
