//! Split and merge migrations.
//!
//! A pass plans every oversized or undersized primary, then runs each
//! migration through the same phases:
//!
//! 1. mark the shards `Splitting` / `Merging`
//! 2. copy the new payloads to every live member and read them back
//! 3. flip the registry under the members' write locks, which fails if any
//!    member's root moved since step 2 started
//! 4. only then drop the superseded blobs
//!
//! No lock is held during the copy. A copy that does not verify on at least
//! `write_quorum` members aborts with the registry untouched; conflicting
//! flips are retried with exponential backoff.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use reef_registry::{MergeCommit, ShardRecord, SplitCommit};
use reef_types::{
    Cid, ClusterEvent, CollectionId, ItemId, NodeId, RebalanceState, ShardId, ShardMetadata,
    ShardPayload,
};
use tracing::{debug, info, warn};

use crate::coordinator::ShardCoordinator;
use crate::error::CoordError;

type Result<T> = std::result::Result<T, CoordError>;

/// Outcome of one [`ShardCoordinator::rebalance`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// `(source, created primary)` for every committed split.
    pub splits: Vec<(ShardId, ShardId)>,
    /// `(source, target)` for every committed merge.
    pub merges: Vec<(ShardId, ShardId)>,
    /// Migrations that gave up, with the reason. They are planned again on
    /// the next pass.
    pub aborted: Vec<(ShardId, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Migration {
    Split(ShardId),
    Merge { source: ShardId, target: ShardId },
}

impl Migration {
    fn shard_id(&self) -> &ShardId {
        match self {
            Self::Split(id) => id,
            Self::Merge { source, .. } => source,
        }
    }
}

/// Payload copy of one set member, staged before the flip.
struct StagedCopy {
    node: NodeId,
    shard_id: ShardId,
    root: Cid,
}

impl ShardCoordinator {
    /// Run one rebalancing pass.
    ///
    /// Returns immediately with an empty report if another pass (or a
    /// repair) holds the rebalance lock.
    pub async fn rebalance(&self) -> RebalanceReport {
        let mut report = RebalanceReport::default();
        let Ok(_guard) = self.rebalance_lock.try_lock() else {
            debug!("rebalance already in progress");
            return report;
        };

        for migration in self.plan_migrations() {
            let mut attempt = 0;
            let outcome = loop {
                let result = match &migration {
                    Migration::Split(source) => self
                        .split_shard(source)
                        .await
                        .map(|created| report.splits.push((source.clone(), created))),
                    Migration::Merge { source, target } => self
                        .merge_shards(source, target)
                        .await
                        .map(|()| report.merges.push((source.clone(), target.clone()))),
                };
                match result {
                    Err(e) if e.is_conflict() && attempt < self.config.rebalance.max_retries => {
                        debug!(shard_id = %migration.shard_id(), attempt, error = %e, "migration flip conflicted, retrying");
                        self.backoff(attempt).await;
                        attempt += 1;
                    }
                    other => break other,
                }
            };

            if let Err(e) = outcome {
                let shard_id = migration.shard_id().clone();
                warn!(%shard_id, error = %e, "migration aborted");
                self.reset_states(&migration);
                self.emit(ClusterEvent::MigrationAborted {
                    shard_id: shard_id.clone(),
                    reason: e.to_string(),
                });
                report.aborted.push((shard_id, e.to_string()));
            }
        }
        report
    }

    /// Pick this pass's migrations and mark their shards pending.
    ///
    /// Undersized primaries are paired in id order with the next sibling of
    /// the same collection and placement, while the pair fits in one shard.
    /// Each set takes part in at most one migration per pass.
    fn plan_migrations(&self) -> Vec<Migration> {
        let cfg = &self.config.rebalance;
        let mut plan = Vec::new();
        let mut undersized: BTreeMap<(CollectionId, Vec<NodeId>), Vec<ShardMetadata>> = BTreeMap::new();

        for primary in self.registry.primaries(None) {
            let balanced = matches!(
                self.registry.rebalance_state(&primary.shard_id),
                Ok(RebalanceState::Balanced)
            );
            if !primary.healthy || !balanced {
                continue;
            }
            if primary.item_count > cfg.split_threshold().max(1) {
                plan.push(Migration::Split(primary.shard_id.clone()));
            } else if primary.item_count < cfg.merge_threshold() {
                undersized
                    .entry((primary.collection.clone(), primary.replica_node_ids.clone()))
                    .or_default()
                    .push(primary);
            }
        }

        for siblings in undersized.into_values() {
            let mut queue = siblings.into_iter();
            let mut pending = queue.next();
            while let Some(target) = pending.take() {
                let Some(source) = queue.next() else { break };
                if target.item_count + source.item_count <= cfg.shard_size {
                    plan.push(Migration::Merge {
                        source: source.shard_id,
                        target: target.shard_id,
                    });
                    pending = queue.next();
                } else {
                    pending = Some(source);
                }
            }
        }

        for migration in &plan {
            let marks = match migration {
                Migration::Split(id) => vec![(id, RebalanceState::SplitPending)],
                Migration::Merge { source, target } => vec![
                    (source, RebalanceState::MergePending),
                    (target, RebalanceState::MergePending),
                ],
            };
            for (id, state) in marks {
                if let Err(e) = self.registry.set_rebalance_state(id, state) {
                    debug!(shard_id = %id, error = %e, "could not mark shard pending");
                }
            }
        }
        if !plan.is_empty() {
            info!(migrations = plan.len(), "planned rebalance");
        }
        plan
    }

    fn reset_states(&self, migration: &Migration) {
        let ids = match migration {
            Migration::Split(id) => vec![id],
            Migration::Merge { source, target } => vec![source, target],
        };
        for id in ids {
            // The shard may be gone if a concurrent merge removed it.
            let _ = self.registry.set_rebalance_state(id, RebalanceState::Balanced);
        }
    }

    /// Move the upper half of `source`'s items into a new set on the same
    /// placement. Returns the new primary.
    #[tracing::instrument(skip(self))]
    async fn split_shard(&self, source: &ShardId) -> Result<ShardId> {
        self.registry
            .set_rebalance_state(source, RebalanceState::Splitting)?;

        let members = self.registry.set_members(source)?;
        let expected_roots: BTreeMap<ShardId, Cid> =
            members.iter().map(|m| (m.shard_id.clone(), m.root_cid)).collect();
        let head = self.registry.record(source)?;
        let placement = head.metadata.replica_node_ids.clone();
        let collection = head.metadata.collection.clone();

        let ids: Vec<&ItemId> = head.payload.items.keys().collect();
        let moved: BTreeSet<ItemId> = ids[ids.len() / 2..].iter().map(|id| (*id).clone()).collect();

        let mut remaining = head.payload.clone();
        remaining.items.retain(|id, _| !moved.contains(id));
        let mut split_off = ShardPayload::new(collection.clone());
        split_off.items.extend(
            head.payload
                .items
                .iter()
                .filter(|(id, _)| moved.contains(*id))
                .map(|(id, cid)| (id.clone(), *cid)),
        );

        let remaining_bytes = Bytes::from(remaining.encode()?);
        let remaining_root = Cid::from_data(&remaining_bytes);
        let split_bytes = Bytes::from(split_off.encode()?);
        let split_root = Cid::from_data(&split_bytes);

        let live: Vec<&ShardMetadata> = members
            .iter()
            .filter(|m| placement.contains(&m.node_id))
            .collect();
        let created_ids: Vec<(NodeId, ShardId)> = placement
            .iter()
            .map(|node| (node.clone(), self.registry.next_shard_id(&collection, node)))
            .collect();

        // Every live member sits on a placement node, so each gets a created id.
        let pairs: Vec<(&ShardMetadata, ShardId)> = live
            .iter()
            .filter_map(|member| {
                created_ids
                    .iter()
                    .find(|(node, _)| node == &member.node_id)
                    .map(|(_, id)| (*member, id.clone()))
            })
            .collect();

        let copies = pairs.into_iter().map(|(member, created)| {
            let remaining_bytes = remaining_bytes.clone();
            let split_bytes = split_bytes.clone();
            async move {
                let mut staged = Vec::with_capacity(2);
                let result = async {
                    self.put_verified(&member.node_id, &member.shard_id, remaining_bytes, remaining_root, true)
                        .await?;
                    staged.push(StagedCopy {
                        node: member.node_id.clone(),
                        shard_id: member.shard_id.clone(),
                        root: remaining_root,
                    });
                    self.put_verified(&member.node_id, &created, split_bytes, split_root, true)
                        .await?;
                    staged.push(StagedCopy {
                        node: member.node_id.clone(),
                        shard_id: created.clone(),
                        root: split_root,
                    });
                    Ok::<(), CoordError>(())
                }
                .await;
                (member.shard_id.clone(), created, result, staged)
            }
        });
        let results = futures::future::join_all(copies).await;

        let mut staged = Vec::new();
        let mut degraded = BTreeSet::new();
        let mut first_error = None;
        for (member_id, created, result, copies) in results {
            staged.extend(copies);
            if let Err(e) = result {
                warn!(shard_id = %member_id, error = %e, "split copy did not verify");
                degraded.insert(member_id);
                degraded.insert(created);
                first_error.get_or_insert(e);
            }
        }

        let acked = live.len() - live.iter().filter(|m| degraded.contains(&m.shard_id)).count();
        let required = self.config.quorum.write_quorum.min(placement.len());
        if acked < required {
            self.drop_staged(&staged, &expected_roots).await;
            return Err(first_error.unwrap_or(CoordError::QuorumNotReached {
                shard_id: source.clone(),
                acked,
                required,
            }));
        }

        let created_primary = created_ids[0].1.clone();
        let mut created = Vec::with_capacity(created_ids.len());
        for (node, id) in &created_ids {
            let metadata = ShardMetadata::new(
                id.clone(),
                collection.clone(),
                node.clone(),
                (id != &created_primary).then(|| created_primary.clone()),
                placement.clone(),
            );
            created.push(ShardRecord::new(metadata, split_off.clone())?);
        }

        let commit = SplitCommit {
            source: source.clone(),
            expected_roots: expected_roots.clone(),
            moved,
            created,
            degraded: degraded.clone(),
        };
        if let Err(e) = self.registry.commit_split(commit) {
            self.drop_staged(&staged, &expected_roots).await;
            return Err(e.into());
        }

        for member in &live {
            if member.root_cid != remaining_root {
                self.delete_blob(&member.node_id, &member.shard_id, member.root_cid)
                    .await;
            }
        }
        self.registry
            .set_rebalance_state(source, RebalanceState::Balanced)?;
        if !degraded.is_empty() {
            self.repairs.enqueue(source, self.healthy_members(source));
            self.repairs
                .enqueue(&created_primary, self.healthy_members(&created_primary));
        }

        info!(%source, created = %created_primary, "split complete");
        self.emit(ClusterEvent::ShardSplit {
            source: source.clone(),
            created: created_primary.clone(),
        });
        Ok(created_primary)
    }

    /// Fold `source`'s items into `target`, which shares its placement.
    #[tracing::instrument(skip(self))]
    async fn merge_shards(&self, source: &ShardId, target: &ShardId) -> Result<()> {
        self.registry
            .set_rebalance_state(source, RebalanceState::Merging)?;
        self.registry
            .set_rebalance_state(target, RebalanceState::Merging)?;

        let source_members = self.registry.set_members(source)?;
        let target_members = self.registry.set_members(target)?;
        let expected_roots: BTreeMap<ShardId, Cid> = source_members
            .iter()
            .chain(target_members.iter())
            .map(|m| (m.shard_id.clone(), m.root_cid))
            .collect();

        let source_record = self.registry.record(source)?;
        let target_record = self.registry.record(target)?;
        let placement = target_record.metadata.replica_node_ids.clone();
        if source_record.metadata.replica_node_ids != placement {
            return Err(CoordError::MigrationVerificationFailed {
                shard_id: source.clone(),
                reason: format!("placement differs from {target}"),
            });
        }

        let mut merged = target_record.payload.clone();
        merged.items.extend(
            source_record
                .payload
                .items
                .iter()
                .map(|(id, cid)| (id.clone(), *cid)),
        );
        let bytes = Bytes::from(merged.encode()?);
        let root = Cid::from_data(&bytes);

        let live: Vec<&ShardMetadata> = target_members
            .iter()
            .filter(|m| placement.contains(&m.node_id))
            .collect();
        let copies = live.iter().map(|member| {
            let bytes = bytes.clone();
            async move {
                let result = self
                    .put_verified(&member.node_id, &member.shard_id, bytes, root, true)
                    .await;
                (*member, result)
            }
        });
        let results = futures::future::join_all(copies).await;

        let mut staged = Vec::new();
        let mut degraded = BTreeSet::new();
        let mut first_error = None;
        for (member, result) in results {
            match result {
                Ok(()) => staged.push(StagedCopy {
                    node: member.node_id.clone(),
                    shard_id: member.shard_id.clone(),
                    root,
                }),
                Err(e) => {
                    warn!(shard_id = %member.shard_id, error = %e, "merge copy did not verify");
                    degraded.insert(member.shard_id.clone());
                    first_error.get_or_insert(e);
                }
            }
        }

        let required = self.config.quorum.write_quorum.min(placement.len());
        if staged.len() < required {
            self.drop_staged(&staged, &expected_roots).await;
            return Err(first_error.unwrap_or(CoordError::QuorumNotReached {
                shard_id: target.clone(),
                acked: staged.len(),
                required,
            }));
        }

        let commit = MergeCommit {
            source: source.clone(),
            target: target.clone(),
            expected_roots: expected_roots.clone(),
            degraded: degraded.clone(),
        };
        let removed = match self.registry.commit_merge(commit) {
            Ok(removed) => removed,
            Err(e) => {
                self.drop_staged(&staged, &expected_roots).await;
                return Err(e.into());
            }
        };

        for record in &removed {
            let m = &record.metadata;
            self.delete_blob(&m.node_id, &m.shard_id, m.root_cid).await;
        }
        for member in &live {
            if member.root_cid != root {
                self.delete_blob(&member.node_id, &member.shard_id, member.root_cid)
                    .await;
            }
        }
        self.registry
            .set_rebalance_state(target, RebalanceState::Balanced)?;
        if !degraded.is_empty() {
            self.repairs.enqueue(target, self.healthy_members(target));
        }

        info!(%source, %target, "merge complete");
        self.emit(ClusterEvent::ShardMerged {
            source: source.clone(),
            target: target.clone(),
        });
        Ok(())
    }

    /// Undo staged copies after an abort. Copies whose content equals a
    /// member's current root are still referenced and kept.
    async fn drop_staged(&self, staged: &[StagedCopy], current: &BTreeMap<ShardId, Cid>) {
        for copy in staged {
            if current.get(&copy.shard_id) != Some(&copy.root) {
                self.delete_blob(&copy.node, &copy.shard_id, copy.root).await;
            }
        }
    }
}
