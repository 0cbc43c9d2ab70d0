//! Replica repair: restores degraded members and refills shard sets that
//! lost nodes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use reef_meta::MetaStore;
use reef_registry::{RegistryError, ShardRecord};
use reef_types::{ClusterEvent, ShardId, ShardMetadata, ShardPayload};
use tracing::{debug, error, info, warn};

use crate::coordinator::ShardCoordinator;
use crate::error::CoordError;

/// Shard sets waiting for repair, most degraded first.
///
/// Entries are keyed by primary and prioritised by how many healthy
/// members survive. When backed by a [`MetaStore`], the queue survives
/// restarts.
#[derive(Default)]
pub(crate) struct RepairQueue {
    entries: Mutex<BTreeMap<ShardId, usize>>,
    meta: Option<Arc<MetaStore>>,
}

impl RepairQueue {
    /// A queue mirrored in `meta`, preloaded with its entries.
    pub(crate) fn persistent(meta: Arc<MetaStore>) -> Result<Self, CoordError> {
        let entries = meta
            .list_repairs()?
            .into_iter()
            .map(|(priority, id)| (id, priority as usize))
            .collect();
        Ok(Self {
            entries: Mutex::new(entries),
            meta: Some(meta),
        })
    }

    /// Queue `primary`, keeping the lowest survivor count seen.
    pub(crate) fn enqueue(&self, primary: &ShardId, surviving: usize) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let priority = entries
            .get(primary)
            .map_or(surviving, |current| (*current).min(surviving));
        entries.insert(primary.clone(), priority);
        if let Some(meta) = &self.meta {
            let persisted = meta
                .remove_repair(primary)
                .and_then(|()| meta.enqueue_repair(primary, priority as u64));
            if let Err(e) = persisted {
                warn!(%primary, error = %e, "failed to persist repair entry");
            }
        }
        debug!(%primary, surviving = priority, "queued shard set for repair");
    }

    /// Take every entry, most urgent first.
    pub(crate) fn drain(&self) -> Vec<(usize, ShardId)> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let mut drained: Vec<(usize, ShardId)> = std::mem::take(&mut *entries)
            .into_iter()
            .map(|(id, surviving)| (surviving, id))
            .collect();
        drained.sort();
        if let Some(meta) = &self.meta {
            for (_, id) in &drained {
                if let Err(e) = meta.remove_repair(id) {
                    warn!(shard_id = %id, error = %e, "failed to drop persisted repair entry");
                }
            }
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }
}

/// Outcome of one [`ShardCoordinator::repair`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// New replicas created on nodes outside the old placement.
    pub repaired: Vec<ShardId>,
    /// Unhealthy members re-copied and marked healthy.
    pub restored: Vec<ShardId>,
    /// Records of departed nodes dropped from the registry.
    pub removed: Vec<ShardId>,
    /// Sets that could not be fully repaired, with the reason.
    pub failed: Vec<(ShardId, String)>,
}

impl ShardCoordinator {
    /// Work through the repair queue once.
    ///
    /// Sets that remain short of replicas are queued again.
    pub async fn repair(&self) -> RepairReport {
        let mut report = RepairReport::default();
        for (surviving, queued) in self.repairs.drain() {
            // Promotions leave old entries pointing at a former primary.
            let primary = match self.registry.get(&queued) {
                Ok(meta) => meta.primary_id().clone(),
                Err(_) => {
                    debug!(shard_id = %queued, "queued set no longer exists");
                    continue;
                }
            };

            match self.repair_set(&primary, &mut report).await {
                Ok(true) => {}
                Ok(false) => self.repairs.enqueue(&primary, self.healthy_members(&primary)),
                Err(CoordError::Registry(RegistryError::ShardNotFound(_))) => {
                    debug!(%primary, "set merged away before repair");
                }
                Err(e) => {
                    if matches!(e, CoordError::NoSource(_)) {
                        error!(%primary, "no intact payload left, set cannot be repaired");
                    } else {
                        warn!(%primary, error = %e, "repair failed, will retry");
                    }
                    report.failed.push((primary.clone(), e.to_string()));
                    self.repairs.enqueue(&primary, surviving);
                }
            }
        }
        report
    }

    /// Number of sets waiting for repair.
    pub fn repair_queue_len(&self) -> usize {
        self.repairs.len()
    }

    /// Repair one set. Returns whether it now has every replica it can get.
    #[tracing::instrument(skip(self, report))]
    async fn repair_set(&self, primary: &ShardId, report: &mut RepairReport) -> Result<bool, CoordError> {
        let _rebalance = self.rebalance_lock.lock().await;
        let _writes = self.write_lock.lock().await;

        let head = self.registry.get(primary)?;
        let placement = head.replica_node_ids.clone();
        let members = self.registry.set_members(primary)?;

        for detached in members
            .iter()
            .filter(|m| !placement.contains(&m.node_id) && &m.shard_id != primary)
        {
            self.delete_blob(&detached.node_id, &detached.shard_id, detached.root_cid)
                .await;
            self.registry.remove_shard(&detached.shard_id)?;
            report.removed.push(detached.shard_id.clone());
        }

        let live: Vec<ShardMetadata> = members
            .into_iter()
            .filter(|m| placement.contains(&m.node_id))
            .collect();
        self.scrub(&live).await?;
        let live: Vec<ShardMetadata> = live
            .iter()
            .map(|m| self.registry.get(&m.shard_id))
            .collect::<Result<_, _>>()?;

        let (bytes, root) = self
            .fetch_verified(&live)
            .await
            .ok_or_else(|| CoordError::NoSource(primary.clone()))?;

        for member in live.iter().filter(|m| !m.healthy) {
            match self
                .put_verified(&member.node_id, &member.shard_id, bytes.clone(), root, true)
                .await
            {
                Ok(()) => {
                    self.registry.restore_shard(&member.shard_id, root)?;
                    info!(shard_id = %member.shard_id, node = %member.node_id, "restored replica");
                    report.restored.push(member.shard_id.clone());
                }
                Err(e) => {
                    warn!(shard_id = %member.shard_id, node = %member.node_id, error = %e, "replica re-copy failed");
                }
            }
        }

        let rf = self.config.placement.replication_factor;
        let candidates = {
            let ring = self.ring.read().await;
            ring.locate(primary, ring.node_count())?
        };
        let mut placed = placement.len();
        for node in candidates.into_iter().filter(|n| !placement.contains(n)) {
            if placed >= rf {
                break;
            }
            let replica = self.registry.next_shard_id(&head.collection, &node);
            if let Err(e) = self
                .put_verified(&node, &replica, bytes.clone(), root, true)
                .await
            {
                warn!(%node, error = %e, "could not place new replica");
                continue;
            }

            let metadata = ShardMetadata::new(
                replica.clone(),
                head.collection.clone(),
                node.clone(),
                Some(primary.clone()),
                placement.clone(),
            );
            let record = ShardRecord::new(metadata, ShardPayload::decode(&bytes)?)?;
            if let Err(e) = self.registry.add_replica(primary, root, record) {
                self.delete_blob(&node, &replica, root).await;
                return Err(e.into());
            }
            self.emit(ClusterEvent::ReplicaRepaired {
                primary: primary.clone(),
                replica: replica.clone(),
            });
            report.repaired.push(replica);
            placed += 1;
        }

        let node_count = self.ring.read().await.node_count();
        Ok(self.healthy_members(primary) >= rf.min(node_count))
    }

    /// Mark healthy live members whose stored payload is missing or corrupt.
    async fn scrub(&self, live: &[ShardMetadata]) -> Result<(), CoordError> {
        for member in live.iter().filter(|m| m.healthy) {
            let intact = match self.stores.get(&member.node_id) {
                Ok(store) => store.verify(&member.root_cid).await.unwrap_or(false),
                Err(_) => false,
            };
            if !intact {
                warn!(shard_id = %member.shard_id, node = %member.node_id, "stored payload missing or corrupt");
                self.registry.set_healthy(&member.shard_id, false)?;
            }
        }
        Ok(())
    }
}
