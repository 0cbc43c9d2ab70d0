//! [`ShardRegistry`] implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use reef_meta::MetaStore;
use reef_types::{
    Cid, CollectionId, ItemId, ItemLocation, NodeId, RebalanceState, ShardId, ShardMetadata,
    ShardPayload, now_millis,
};
use tracing::{debug, info, warn};

use crate::RegistryError;

type Result<T> = std::result::Result<T, RegistryError>;
type Handle = Arc<Slot>;
type Guards<'a> = Vec<RwLockWriteGuard<'a, ShardRecord>>;

/// Attempts at locking a shard set whose membership keeps changing.
const SET_LOCK_ATTEMPTS: usize = 8;

/// Everything the registry knows about one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRecord {
    pub metadata: ShardMetadata,
    pub payload: ShardPayload,
    pub rebalance: RebalanceState,
}

impl ShardRecord {
    /// Build a record and derive its counters and root from `payload`.
    pub fn new(mut metadata: ShardMetadata, payload: ShardPayload) -> Result<Self> {
        metadata.refresh_from(&payload)?;
        Ok(Self {
            metadata,
            payload,
            rebalance: RebalanceState::Balanced,
        })
    }

    fn refresh(&mut self) -> Result<()> {
        self.metadata.refresh_from(&self.payload)?;
        Ok(())
    }

    fn touch(&mut self) {
        self.metadata.updated_at = now_millis().max(self.metadata.updated_at);
    }
}

/// Committed view of a record, readable while a writer holds the record.
#[derive(Debug, Clone)]
struct Published {
    metadata: ShardMetadata,
    rebalance: RebalanceState,
    version: u64,
}

/// One registry entry.
///
/// `record` is the working copy writers lock. Every writer refreshes
/// `published` before releasing `record`, so metadata lookups and listings
/// read `published` alone and never queue behind a multi-shard flip.
struct Slot {
    record: RwLock<ShardRecord>,
    published: RwLock<Published>,
    /// Highest published version written to the meta store.
    persisted: Mutex<u64>,
    retired: AtomicBool,
}

impl Slot {
    fn new(record: ShardRecord) -> Handle {
        Arc::new(Self {
            published: RwLock::new(Published {
                metadata: record.metadata.clone(),
                rebalance: record.rebalance,
                version: 1,
            }),
            record: RwLock::new(record),
            persisted: Mutex::new(0),
            retired: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> RwLockWriteGuard<'_, ShardRecord> {
        self.record.write().expect("lock poisoned")
    }

    fn publish(&self, record: &ShardRecord) {
        let mut published = self.published.write().expect("lock poisoned");
        published.metadata = record.metadata.clone();
        published.rebalance = record.rebalance;
        published.version += 1;
    }

    fn snapshot(&self) -> Published {
        self.published.read().expect("lock poisoned").clone()
    }

    fn metadata(&self) -> ShardMetadata {
        self.published.read().expect("lock poisoned").metadata.clone()
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

/// Result of detaching a departed node from one shard set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachOutcome {
    /// The set's primary after the detach.
    pub primary: ShardId,
    /// Set when a replica was promoted because the primary's node left.
    pub promoted: Option<ShardId>,
    /// Healthy members still hosted on placement nodes.
    pub surviving: usize,
}

impl DetachOutcome {
    /// No healthy member survived: the set's items are unavailable.
    pub fn is_lost(&self) -> bool {
        self.surviving == 0
    }
}

/// Atomic flip of a split: moves `moved` from every source member into the
/// freshly copied `created` set.
#[derive(Debug, Clone)]
pub struct SplitCommit {
    pub source: ShardId,
    /// Root of every source member when the copy started.
    pub expected_roots: BTreeMap<ShardId, Cid>,
    pub moved: BTreeSet<ItemId>,
    /// The new set, primary first. Payloads must hold exactly `moved`.
    pub created: Vec<ShardRecord>,
    /// Members whose copy did not verify; registered unhealthy.
    pub degraded: BTreeSet<ShardId>,
}

/// Atomic flip of a merge: folds `source` into `target`.
#[derive(Debug, Clone)]
pub struct MergeCommit {
    pub source: ShardId,
    pub target: ShardId,
    /// Root of every member of both sets when the copy started.
    pub expected_roots: BTreeMap<ShardId, Cid>,
    /// Target members whose copy did not verify; marked unhealthy.
    pub degraded: BTreeSet<ShardId>,
}

/// Authoritative mapping of shards, replicas and items.
pub struct ShardRegistry {
    shards: RwLock<HashMap<ShardId, Handle>>,
    /// Primary → ids of every record pointing at it, the primary included.
    sets: RwLock<HashMap<ShardId, BTreeSet<ShardId>>>,
    items: RwLock<HashMap<ItemId, ShardId>>,
    sequence: AtomicU64,
    meta: Option<Arc<MetaStore>>,
}

impl Default for ShardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardRegistry {
    /// Create an empty, in-memory registry.
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
            items: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            meta: None,
        }
    }

    /// Create an empty registry that writes every change through to `meta`.
    pub fn with_meta(meta: Arc<MetaStore>) -> Self {
        Self {
            meta: Some(meta),
            ..Self::new()
        }
    }

    /// Rebuild a registry from its persisted state.
    ///
    /// Payloads are reconstructed from the item index: every member of a set
    /// receives the items pointing at the set's primary. Records whose
    /// rebuilt root disagrees with the persisted one are loaded unhealthy.
    pub fn load(meta: Arc<MetaStore>) -> Result<Self> {
        let mut records: BTreeMap<ShardId, ShardRecord> = BTreeMap::new();
        let mut max_sequence = None;
        for metadata in meta.list_shards()? {
            max_sequence = max_sequence.max(sequence_of(&metadata.shard_id));
            let payload = ShardPayload::new(metadata.collection.clone());
            records.insert(
                metadata.shard_id.clone(),
                ShardRecord {
                    metadata,
                    payload,
                    rebalance: RebalanceState::Balanced,
                },
            );
        }

        let mut sets: HashMap<ShardId, BTreeSet<ShardId>> = HashMap::new();
        for record in records.values() {
            sets.entry(record.metadata.primary_id().clone())
                .or_default()
                .insert(record.metadata.shard_id.clone());
        }

        let mut items = HashMap::new();
        for (item_id, location) in meta.list_items()? {
            let Some(set) = sets.get(&location.shard_id) else {
                warn!(%item_id, shard_id = %location.shard_id, "item points at unknown shard, skipping");
                continue;
            };
            for shard_id in set {
                if let Some(record) = records.get_mut(shard_id) {
                    record
                        .payload
                        .items
                        .insert(item_id.clone(), location.item_cid);
                }
            }
            items.insert(item_id, location.shard_id);
        }

        let mut shards = HashMap::new();
        for (shard_id, mut record) in records {
            let root = record.payload.root_cid()?;
            if root != record.metadata.root_cid {
                warn!(%shard_id, "rebuilt payload disagrees with persisted root, marking unhealthy");
                record.metadata.healthy = false;
            }
            record.metadata.item_count = record.payload.items.len() as u64;
            record.metadata.size_bytes = record.payload.size_bytes();
            shards.insert(shard_id, Slot::new(record));
        }

        info!(shards = shards.len(), items = items.len(), "loaded shard registry");
        Ok(Self {
            shards: RwLock::new(shards),
            sets: RwLock::new(sets),
            items: RwLock::new(items),
            sequence: AtomicU64::new(max_sequence.map_or(0, |s| s + 1)),
            meta: Some(meta),
        })
    }

    // ----- Lookups -----

    /// Allocate a fresh shard id for a record owned by `owner`.
    pub fn next_shard_id(&self, collection: &CollectionId, owner: &NodeId) -> ShardId {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        ShardId::compose(collection, owner, sequence)
    }

    /// Metadata of one shard.
    pub fn get(&self, shard_id: &ShardId) -> Result<ShardMetadata> {
        Ok(self.handle(shard_id)?.metadata())
    }

    /// Full copy of one shard record.
    pub fn record(&self, shard_id: &ShardId) -> Result<ShardRecord> {
        let handle = self.handle(shard_id)?;
        let record = handle.record.read().expect("lock poisoned");
        Ok(record.clone())
    }

    /// Item ids held by a shard, in sorted order.
    pub fn item_ids(&self, shard_id: &ShardId) -> Result<Vec<ItemId>> {
        let handle = self.handle(shard_id)?;
        let record = handle.record.read().expect("lock poisoned");
        Ok(record.payload.items.keys().cloned().collect())
    }

    pub fn rebalance_state(&self, shard_id: &ShardId) -> Result<RebalanceState> {
        Ok(self.handle(shard_id)?.snapshot().rebalance)
    }

    /// Primary shard holding `item_id`.
    pub fn find_shard(&self, item_id: &ItemId) -> Result<ShardId> {
        self.items
            .read()
            .expect("lock poisoned")
            .get(item_id)
            .cloned()
            .ok_or_else(|| RegistryError::ItemNotFound(item_id.clone()))
    }

    /// Shards a node hosts: it owns the record or appears in its placement.
    pub fn shards_for_node(&self, node_id: &NodeId) -> BTreeSet<ShardId> {
        self.live_handles()
            .into_iter()
            .filter(|(_, h)| h.metadata().involves(node_id))
            .map(|(id, _)| id)
            .collect()
    }

    /// Metadata of every shard, sorted by id.
    pub fn list(&self) -> Vec<ShardMetadata> {
        let mut all: Vec<ShardMetadata> = self
            .live_handles()
            .iter()
            .map(|(_, h)| h.metadata())
            .collect();
        all.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        all
    }

    /// Primary records, optionally restricted to one collection.
    pub fn primaries(&self, collection: Option<&CollectionId>) -> Vec<ShardMetadata> {
        self.list()
            .into_iter()
            .filter(|m| m.is_primary())
            .filter(|m| collection.is_none_or(|c| &m.collection == c))
            .collect()
    }

    /// Members of `primary`'s set: live members in placement order, then
    /// any detached records still awaiting cleanup.
    pub fn set_members(&self, primary: &ShardId) -> Result<Vec<ShardMetadata>> {
        let handles = self.member_handles(primary)?;
        let mut members: Vec<ShardMetadata> = handles
            .iter()
            .filter(|(_, h)| !h.is_retired())
            .map(|(_, h)| h.metadata())
            .collect();
        let placement = members
            .iter()
            .find(|m| &m.shard_id == primary)
            .map(|m| m.replica_node_ids.clone())
            .unwrap_or_default();
        members.sort_by_key(|m| {
            (
                placement
                    .iter()
                    .position(|n| n == &m.node_id)
                    .unwrap_or(usize::MAX),
                m.shard_id.clone(),
            )
        });
        Ok(members)
    }

    /// A healthy, balanced primary of `collection` placed exactly on
    /// `placement` with room for another item.
    pub fn find_reusable_set(
        &self,
        collection: &CollectionId,
        placement: &[NodeId],
        capacity: u64,
    ) -> Option<ShardId> {
        self.live_handles()
            .into_iter()
            .filter(|(_, h)| {
                let published = h.snapshot();
                let m = &published.metadata;
                m.is_primary()
                    && m.healthy
                    && &m.collection == collection
                    && m.replica_node_ids == placement
                    && published.rebalance == RebalanceState::Balanced
                    && m.item_count < capacity
            })
            .map(|(id, _)| id)
            .min()
    }

    /// Number of assigned items.
    pub fn item_count(&self) -> usize {
        self.items.read().expect("lock poisoned").len()
    }

    // ----- Single-record updates -----

    /// Insert or overwrite a shard's metadata.
    ///
    /// Registration is idempotent and last-writer-wins on `updated_at`: an
    /// older record never replaces a newer one. Returns whether the record
    /// was applied.
    pub fn register_shard(&self, metadata: ShardMetadata) -> Result<bool> {
        loop {
            let existing = self.handle(&metadata.shard_id).ok();
            if let Some(handle) = existing {
                let mut record = handle.lock();
                if handle.is_retired() {
                    continue;
                }
                if is_stale(&metadata, &record.metadata) {
                    debug!(shard_id = %metadata.shard_id, "ignoring stale shard registration");
                    return Ok(false);
                }
                let previous = record.metadata.primary_id().clone();
                record.metadata = metadata.clone();
                if &previous != metadata.primary_id() {
                    self.reindex(&metadata.shard_id, &previous, metadata.primary_id());
                }
                handle.publish(&record);
                drop(record);
                self.persist_slot(&handle)?;
                return Ok(true);
            }

            let handle = Slot::new(ShardRecord {
                payload: ShardPayload::new(metadata.collection.clone()),
                metadata: metadata.clone(),
                rebalance: RebalanceState::Balanced,
            });
            {
                let mut map = self.shards.write().expect("lock poisoned");
                if map.contains_key(&metadata.shard_id) {
                    // Lost a race with another registration; apply LWW against it.
                    continue;
                }
                map.insert(metadata.shard_id.clone(), handle.clone());
            }
            self.sets
                .write()
                .expect("lock poisoned")
                .entry(metadata.primary_id().clone())
                .or_default()
                .insert(metadata.shard_id.clone());
            self.persist_slot(&handle)?;
            debug!(shard_id = %metadata.shard_id, "registered shard");
            return Ok(true);
        }
    }

    /// Point `item_id` at `shard_id`. The shard must exist.
    pub fn assign_item(&self, item_id: ItemId, shard_id: &ShardId) -> Result<()> {
        let handle = self.handle(shard_id)?;
        let cid = {
            let record = handle.record.read().expect("lock poisoned");
            record
                .payload
                .items
                .get(&item_id)
                .copied()
                .unwrap_or(Cid::ZERO)
        };
        self.items
            .write()
            .expect("lock poisoned")
            .insert(item_id.clone(), shard_id.clone());
        self.persist_item(&item_id, shard_id, cid)?;
        debug!(%item_id, %shard_id, "assigned item");
        Ok(())
    }

    pub fn set_healthy(&self, shard_id: &ShardId, healthy: bool) -> Result<()> {
        let handle = self.handle(shard_id)?;
        {
            let mut record = handle.lock();
            if record.metadata.healthy == healthy {
                return Ok(());
            }
            record.metadata.healthy = healthy;
            record.touch();
            handle.publish(&record);
        }
        self.persist_slot(&handle)
    }

    /// Mark a re-copied shard healthy, provided its content did not move on.
    pub fn restore_shard(&self, shard_id: &ShardId, expected_root: Cid) -> Result<()> {
        let handle = self.handle(shard_id)?;
        {
            let mut record = handle.lock();
            if record.metadata.root_cid != expected_root {
                return Err(RegistryError::conflict(shard_id, "content changed during repair"));
            }
            record.metadata.healthy = true;
            record.touch();
            handle.publish(&record);
        }
        self.persist_slot(&handle)
    }

    pub fn set_rebalance_state(&self, shard_id: &ShardId, state: RebalanceState) -> Result<()> {
        let handle = self.handle(shard_id)?;
        let mut record = handle.lock();
        record.rebalance = state;
        handle.publish(&record);
        Ok(())
    }

    /// Drop a detached record. Primaries that other records still point at
    /// cannot be removed.
    pub fn remove_shard(&self, shard_id: &ShardId) -> Result<ShardRecord> {
        let handle = self.handle(shard_id)?;
        let record = {
            // Replicas join a set under every member's lock, so holding this
            // one keeps the reference check current.
            let guard = handle.lock();
            if handle.is_retired() {
                return Err(RegistryError::ShardNotFound(shard_id.clone()));
            }
            let referenced = self
                .sets
                .read()
                .expect("lock poisoned")
                .get(shard_id)
                .is_some_and(|members| members.iter().any(|id| id != shard_id));
            if referenced {
                return Err(RegistryError::Invalid(format!(
                    "{shard_id} is still the primary of live replicas"
                )));
            }
            handle.retired.store(true, Ordering::SeqCst);
            self.unindex(shard_id, guard.metadata.primary_id());
            self.shards.write().expect("lock poisoned").remove(shard_id);
            guard.clone()
        };

        self.retire_slot(shard_id, &handle)?;
        debug!(%shard_id, "removed shard record");
        Ok(record)
    }

    // ----- Shard-set updates -----

    /// Register a brand-new shard set (primary first) and point every item
    /// in its payload at the primary.
    pub fn insert_set(&self, records: Vec<ShardRecord>) -> Result<ShardId> {
        let primary = validate_new_set(&records)?;
        let pointers: Vec<(ItemId, Cid)> = records[0]
            .payload
            .items
            .iter()
            .map(|(id, cid)| (id.clone(), *cid))
            .collect();

        let mut handles = Vec::with_capacity(records.len());
        for mut record in records {
            record.refresh()?;
            handles.push((record.metadata.shard_id.clone(), Slot::new(record)));
        }

        {
            let mut map = self.shards.write().expect("lock poisoned");
            if let Some((existing, _)) = handles.iter().find(|(id, _)| map.contains_key(id)) {
                return Err(RegistryError::Invalid(format!(
                    "shard {existing} already registered"
                )));
            }
            for (id, handle) in &handles {
                map.insert(id.clone(), handle.clone());
            }
        }
        self.sets
            .write()
            .expect("lock poisoned")
            .insert(primary.clone(), handles.iter().map(|(id, _)| id.clone()).collect());
        {
            let mut items = self.items.write().expect("lock poisoned");
            for (item_id, _) in &pointers {
                items.insert(item_id.clone(), primary.clone());
            }
        }

        self.persist_slots(&handles)?;
        for (item_id, cid) in pointers {
            self.persist_item(&item_id, &primary, cid)?;
        }
        debug!(%primary, members = handles.len(), "registered shard set");
        Ok(primary)
    }

    /// Add `item_id` to every live member of `primary`'s set.
    ///
    /// `expected_roots` are the member roots observed before the payload was
    /// written to storage; any change fails with a conflict and leaves the
    /// registry untouched. Members in `degraded` did not acknowledge the
    /// write and are marked unhealthy.
    pub fn commit_item(
        &self,
        primary: &ShardId,
        item_id: &ItemId,
        item_cid: Cid,
        expected_roots: &BTreeMap<ShardId, Cid>,
        degraded: &BTreeSet<ShardId>,
    ) -> Result<()> {
        self.with_set(primary, |guards| {
            for guard in guards.iter() {
                if let Some(expected) = expected_roots.get(&guard.metadata.shard_id)
                    && guard.metadata.root_cid != *expected
                {
                    return Err(RegistryError::conflict(
                        &guard.metadata.shard_id,
                        "payload changed during write",
                    ));
                }
            }

            let mut items = self.items.write().expect("lock poisoned");
            if let Some(current) = items.get(item_id)
                && current != primary
            {
                return Err(RegistryError::conflict(
                    primary,
                    format!("{item_id} already belongs to {current}"),
                ));
            }

            let placement = placement_of(guards, primary);
            for guard in guards.iter_mut() {
                if !placement.contains(&guard.metadata.node_id) {
                    continue;
                }
                guard.payload.items.insert(item_id.clone(), item_cid);
                guard.refresh()?;
                if degraded.contains(&guard.metadata.shard_id) {
                    guard.metadata.healthy = false;
                }
            }
            items.insert(item_id.clone(), primary.clone());
            Ok(())
        })?;
        self.persist_item(item_id, primary, item_cid)
    }

    /// Remove a departed node from `primary`'s set.
    ///
    /// Records hosted on the node turn unhealthy and the node leaves every
    /// member's placement. If it hosted the primary, the first healthy
    /// replica in placement order is promoted and the set's items are
    /// re-pointed at it.
    pub fn detach_node(&self, primary: &ShardId, node_id: &NodeId) -> Result<DetachOutcome> {
        let mut repointed: Vec<(ItemId, Cid)> = Vec::new();
        let outcome = self.with_set(primary, |guards| {
            for guard in guards.iter_mut() {
                if &guard.metadata.node_id == node_id {
                    guard.metadata.healthy = false;
                }
                guard.metadata.replica_node_ids.retain(|n| n != node_id);
                guard.touch();
            }

            let placement = placement_of(guards, primary);
            let mut current = primary.clone();
            let mut promoted = None;

            let primary_gone = guards
                .iter()
                .any(|g| &g.metadata.shard_id == primary && &g.metadata.node_id == node_id);
            if primary_gone {
                let successor = placement.iter().find_map(|node| {
                    guards.iter().position(|g| {
                        &g.metadata.node_id == node
                            && g.metadata.healthy
                            && &g.metadata.shard_id != primary
                    })
                });
                if let Some(index) = successor {
                    let new_primary = guards[index].metadata.shard_id.clone();
                    for guard in guards.iter_mut() {
                        guard.metadata.primary = if guard.metadata.shard_id == new_primary {
                            None
                        } else {
                            Some(new_primary.clone())
                        };
                    }
                    {
                        let mut sets = self.sets.write().expect("lock poisoned");
                        if let Some(members) = sets.remove(primary) {
                            sets.insert(new_primary.clone(), members);
                        }
                    }

                    let mut items = self.items.write().expect("lock poisoned");
                    for (item_id, cid) in &guards[index].payload.items {
                        if items.get(item_id) == Some(primary) {
                            items.insert(item_id.clone(), new_primary.clone());
                            repointed.push((item_id.clone(), *cid));
                        }
                    }
                    info!(previous = %primary, promoted = %new_primary, "promoted replica to primary");
                    current = new_primary.clone();
                    promoted = Some(new_primary);
                }
            }

            let surviving = guards
                .iter()
                .filter(|g| g.metadata.healthy && placement.contains(&g.metadata.node_id))
                .count();
            Ok(DetachOutcome {
                primary: current,
                promoted,
                surviving,
            })
        })?;

        for (item_id, cid) in &repointed {
            self.persist_item(item_id, &outcome.primary, *cid)?;
        }
        Ok(outcome)
    }

    /// Register a freshly copied replica of `primary` and extend the set's
    /// placement with its node.
    ///
    /// Fails with a conflict if the primary's root is no longer
    /// `expected_root`, so a repair racing a write never registers stale data.
    pub fn add_replica(
        &self,
        primary: &ShardId,
        expected_root: Cid,
        mut record: ShardRecord,
    ) -> Result<()> {
        let replica_id = record.metadata.shard_id.clone();
        if self.handle(&replica_id).is_ok() {
            return Err(RegistryError::Invalid(format!(
                "shard {replica_id} already registered"
            )));
        }
        record.refresh()?;
        if record.metadata.root_cid != expected_root {
            return Err(RegistryError::Invalid(format!(
                "replica {replica_id} diverges from {primary}"
            )));
        }

        let handle = self.with_set(primary, |guards| {
            let placement = placement_of(guards, primary);
            let primary_root = guards
                .iter()
                .find(|g| &g.metadata.shard_id == primary)
                .map(|g| g.metadata.root_cid)
                .unwrap_or(Cid::ZERO);
            if primary_root != expected_root {
                return Err(RegistryError::conflict(primary, "content changed during repair"));
            }
            if placement.contains(&record.metadata.node_id) {
                return Err(RegistryError::Invalid(format!(
                    "{} already hosts a member of {primary}",
                    record.metadata.node_id
                )));
            }

            let mut extended = placement.clone();
            extended.push(record.metadata.node_id.clone());
            let mut replica = record.clone();
            replica.metadata.primary = Some(primary.clone());
            replica.metadata.replica_node_ids = extended.clone();
            let handle = Slot::new(replica);
            {
                let mut map = self.shards.write().expect("lock poisoned");
                if map.contains_key(&replica_id) {
                    return Err(RegistryError::Invalid(format!(
                        "shard {replica_id} already registered"
                    )));
                }
                map.insert(replica_id.clone(), handle.clone());
            }
            self.sets
                .write()
                .expect("lock poisoned")
                .entry(primary.clone())
                .or_default()
                .insert(replica_id.clone());

            for guard in guards.iter_mut() {
                if placement.contains(&guard.metadata.node_id) {
                    guard.metadata.replica_node_ids = extended.clone();
                    guard.touch();
                }
            }
            Ok(handle)
        })?;

        self.persist_slot(&handle)?;
        info!(%primary, replica = %replica_id, node = %record.metadata.node_id, "registered replica");
        Ok(())
    }

    /// Flip a verified split: the moved items leave every source member and
    /// the created set is registered, all under the members' write locks.
    pub fn commit_split(&self, commit: SplitCommit) -> Result<ShardId> {
        let created_primary = validate_new_set(&commit.created)?;
        if commit.created[0].payload.items.keys().ne(commit.moved.iter()) {
            return Err(RegistryError::Invalid(
                "created payload does not match moved items".into(),
            ));
        }
        if let Some(existing) = commit
            .created
            .iter()
            .find(|r| self.handle(&r.metadata.shard_id).is_ok())
        {
            return Err(RegistryError::Invalid(format!(
                "shard {} already registered",
                existing.metadata.shard_id
            )));
        }

        let pointers: Vec<(ItemId, Cid)> = commit.created[0]
            .payload
            .items
            .iter()
            .map(|(id, cid)| (id.clone(), *cid))
            .collect();
        let mut created = Vec::with_capacity(commit.created.len());
        for record in &commit.created {
            let mut record = record.clone();
            record.refresh()?;
            if commit.degraded.contains(&record.metadata.shard_id) {
                record.metadata.healthy = false;
            }
            created.push((record.metadata.shard_id.clone(), Slot::new(record)));
        }

        self.with_set(&commit.source, |guards| {
            check_roots(guards, &commit.expected_roots)?;

            let placement = placement_of(guards, &commit.source);
            for guard in guards.iter_mut() {
                if !placement.contains(&guard.metadata.node_id) {
                    continue;
                }
                guard.payload.items.retain(|id, _| !commit.moved.contains(id));
                guard.refresh()?;
                if commit.degraded.contains(&guard.metadata.shard_id) {
                    guard.metadata.healthy = false;
                }
            }

            {
                let mut map = self.shards.write().expect("lock poisoned");
                for (id, handle) in &created {
                    map.insert(id.clone(), handle.clone());
                }
            }
            self.sets.write().expect("lock poisoned").insert(
                created_primary.clone(),
                created.iter().map(|(id, _)| id.clone()).collect(),
            );
            let mut items = self.items.write().expect("lock poisoned");
            for (item_id, _) in &pointers {
                items.insert(item_id.clone(), created_primary.clone());
            }
            Ok(())
        })?;

        self.persist_slots(&created)?;
        for (item_id, cid) in pointers {
            self.persist_item(&item_id, &created_primary, cid)?;
        }

        info!(source = %commit.source, created = %created_primary, moved = commit.moved.len(), "split committed");
        Ok(created_primary)
    }

    /// Flip a verified merge: `target` members absorb the source's items and
    /// the source set is dropped, all under both sets' write locks.
    ///
    /// Returns the removed source records.
    pub fn commit_merge(&self, commit: MergeCommit) -> Result<Vec<ShardRecord>> {
        let mut handles = self.member_handles(&commit.source)?;
        handles.extend(self.member_handles(&commit.target)?);
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles.dedup_by(|a, b| a.0 == b.0);

        let mut guards = lock_all(&handles);
        if handles.iter().any(|(_, h)| h.is_retired()) {
            return Err(RegistryError::conflict(&commit.source, "set membership changed"));
        }
        let (source_guards, mut target_guards): (Vec<&mut ShardRecord>, Vec<&mut ShardRecord>) =
            guards
                .iter_mut()
                .map(|g| &mut **g)
                .partition(|r| r.metadata.primary_id() == &commit.source);
        if !is_complete(&commit.source, &source_guards)?
            || !is_complete(&commit.target, &target_guards)?
        {
            return Err(RegistryError::conflict(&commit.source, "set membership changed"));
        }
        check_roots(&source_guards, &commit.expected_roots)?;
        check_roots(&target_guards, &commit.expected_roots)?;

        let source_placement = placement_of(&source_guards, &commit.source);
        let target_placement = placement_of(&target_guards, &commit.target);
        if source_placement != target_placement {
            return Err(RegistryError::Invalid(format!(
                "{} and {} are placed differently",
                commit.source, commit.target
            )));
        }

        let moved: BTreeMap<ItemId, Cid> = source_guards
            .iter()
            .find(|g| g.metadata.shard_id == commit.source)
            .map(|g| g.payload.items.clone())
            .unwrap_or_default();

        for guard in target_guards.iter_mut() {
            if !target_placement.contains(&guard.metadata.node_id) {
                continue;
            }
            guard
                .payload
                .items
                .extend(moved.iter().map(|(id, cid)| (id.clone(), *cid)));
            guard.refresh()?;
            if commit.degraded.contains(&guard.metadata.shard_id) {
                guard.metadata.healthy = false;
            }
        }

        let removed: Vec<ShardRecord> = source_guards.iter().map(|g| (**g).clone()).collect();
        {
            let mut items = self.items.write().expect("lock poisoned");
            for item_id in moved.keys() {
                items.insert(item_id.clone(), commit.target.clone());
            }
        }
        self.sets.write().expect("lock poisoned").remove(&commit.source);
        {
            let mut map = self.shards.write().expect("lock poisoned");
            for record in &removed {
                map.remove(&record.metadata.shard_id);
            }
        }

        let (retired, kept): (Vec<_>, Vec<_>) = handles
            .iter()
            .zip(guards.iter())
            .partition(|(_, g)| g.metadata.primary_id() == &commit.source);
        for ((_, handle), _) in &retired {
            handle.retired.store(true, Ordering::SeqCst);
        }
        for ((_, handle), guard) in &kept {
            handle.publish(guard);
        }
        let retired: Vec<(ShardId, Handle)> = retired.into_iter().map(|(h, _)| h.clone()).collect();
        let kept: Vec<(ShardId, Handle)> = kept.into_iter().map(|(h, _)| h.clone()).collect();
        drop(guards);

        self.persist_slots(&kept)?;
        for (id, handle) in &retired {
            self.retire_slot(id, handle)?;
        }
        for (item_id, cid) in &moved {
            self.persist_item(item_id, &commit.target, *cid)?;
        }

        info!(source = %commit.source, target = %commit.target, moved = moved.len(), "merge committed");
        Ok(removed)
    }

    // ----- Internals -----

    fn handle(&self, shard_id: &ShardId) -> Result<Handle> {
        self.shards
            .read()
            .expect("lock poisoned")
            .get(shard_id)
            .cloned()
            .ok_or_else(|| RegistryError::ShardNotFound(shard_id.clone()))
    }

    /// Every registered handle, copied out so no lock outlives the call.
    fn live_handles(&self) -> Vec<(ShardId, Handle)> {
        self.shards
            .read()
            .expect("lock poisoned")
            .iter()
            .filter(|(_, h)| !h.is_retired())
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect()
    }

    /// Handles for `primary` and every record pointing at it, sorted by id.
    /// Reads the set index only; no record is touched.
    fn member_handles(&self, primary: &ShardId) -> Result<Vec<(ShardId, Handle)>> {
        let ids = self
            .sets
            .read()
            .expect("lock poisoned")
            .get(primary)
            .cloned()
            .ok_or_else(|| RegistryError::ShardNotFound(primary.clone()))?;
        let map = self.shards.read().expect("lock poisoned");
        if !map.contains_key(primary) {
            return Err(RegistryError::ShardNotFound(primary.clone()));
        }
        Ok(ids
            .into_iter()
            .filter_map(|id| map.get(&id).map(|h| (id, h.clone())))
            .collect())
    }

    /// Move `shard_id` from `from`'s set entry to `to`'s.
    fn reindex(&self, shard_id: &ShardId, from: &ShardId, to: &ShardId) {
        self.unindex(shard_id, from);
        self.sets
            .write()
            .expect("lock poisoned")
            .entry(to.clone())
            .or_default()
            .insert(shard_id.clone());
    }

    fn unindex(&self, shard_id: &ShardId, primary: &ShardId) {
        let mut sets = self.sets.write().expect("lock poisoned");
        if let Some(members) = sets.get_mut(primary) {
            members.remove(shard_id);
            if members.is_empty() {
                sets.remove(primary);
            }
        }
    }

    /// Lock every member of `primary`'s set and run `f`, retrying while the
    /// membership shifts between lookup and locking. Changes are published
    /// before the locks drop and persisted after. `f` must not mutate before
    /// failing.
    fn with_set<R>(
        &self,
        primary: &ShardId,
        mut f: impl FnMut(&mut [RwLockWriteGuard<'_, ShardRecord>]) -> Result<R>,
    ) -> Result<R> {
        for _ in 0..SET_LOCK_ATTEMPTS {
            let handles = self.member_handles(primary)?;
            let mut guards = lock_all(&handles);
            if handles.iter().any(|(_, h)| h.is_retired()) || !is_complete(primary, &guards)? {
                continue;
            }
            let out = f(&mut guards)?;
            for ((_, handle), guard) in handles.iter().zip(guards.iter()) {
                handle.publish(guard);
            }
            drop(guards);
            self.persist_slots(&handles)?;
            return Ok(out);
        }
        Err(RegistryError::conflict(primary, "set membership kept changing"))
    }

    fn persist_slots(&self, handles: &[(ShardId, Handle)]) -> Result<()> {
        for (_, handle) in handles {
            self.persist_slot(handle)?;
        }
        Ok(())
    }

    /// Write the published metadata unless a newer version already landed.
    fn persist_slot(&self, handle: &Slot) -> Result<()> {
        let Some(meta) = &self.meta else {
            return Ok(());
        };
        let mut persisted = handle.persisted.lock().expect("lock poisoned");
        let published = handle.snapshot();
        if published.version <= *persisted {
            return Ok(());
        }
        meta.put_shard(&published.metadata)?;
        *persisted = published.version;
        Ok(())
    }

    /// Delete a retired record from the meta store; later persists skip it.
    fn retire_slot(&self, shard_id: &ShardId, handle: &Slot) -> Result<()> {
        let mut persisted = handle.persisted.lock().expect("lock poisoned");
        *persisted = u64::MAX;
        if let Some(meta) = &self.meta {
            meta.delete_shard(shard_id)?;
        }
        Ok(())
    }

    fn persist_item(&self, item_id: &ItemId, shard_id: &ShardId, item_cid: Cid) -> Result<()> {
        if let Some(meta) = &self.meta {
            meta.put_item(
                item_id,
                &ItemLocation {
                    shard_id: shard_id.clone(),
                    item_cid,
                },
            )?;
        }
        Ok(())
    }
}

fn lock_all(handles: &[(ShardId, Handle)]) -> Guards<'_> {
    handles.iter().map(|(_, h)| h.lock()).collect()
}

/// Whether the locked records are exactly `primary`'s current set: the
/// primary is still primary, every member still points at it, and every
/// placement node has a locked record.
fn is_complete<G>(primary: &ShardId, guards: &[G]) -> Result<bool>
where
    G: std::ops::Deref<Target = ShardRecord>,
{
    let Some(head) = guards.iter().find(|g| &g.metadata.shard_id == primary) else {
        return Ok(false);
    };
    if !head.metadata.is_primary() {
        return Err(RegistryError::conflict(primary, "no longer a primary"));
    }
    if guards.iter().any(|g| g.metadata.primary_id() != primary) {
        return Ok(false);
    }
    Ok(head
        .metadata
        .replica_node_ids
        .iter()
        .all(|node| guards.iter().any(|g| &g.metadata.node_id == node)))
}

fn placement_of<G>(guards: &[G], primary: &ShardId) -> Vec<NodeId>
where
    G: std::ops::Deref<Target = ShardRecord>,
{
    guards
        .iter()
        .find(|g| &g.metadata.shard_id == primary)
        .map(|g| g.metadata.replica_node_ids.clone())
        .unwrap_or_default()
}

fn check_roots<G>(guards: &[G], expected: &BTreeMap<ShardId, Cid>) -> Result<()>
where
    G: std::ops::Deref<Target = ShardRecord>,
{
    for guard in guards {
        let id = &guard.metadata.shard_id;
        match expected.get(id) {
            Some(root) if *root == guard.metadata.root_cid => {}
            Some(_) => return Err(RegistryError::conflict(id, "payload changed during migration")),
            None => return Err(RegistryError::conflict(id, "member appeared during migration")),
        }
    }
    Ok(())
}

/// A new set lists its primary first, every other member points at it, and
/// all members carry the same placement and payload.
fn validate_new_set(records: &[ShardRecord]) -> Result<ShardId> {
    let Some(head) = records.first() else {
        return Err(RegistryError::Invalid("empty shard set".into()));
    };
    if !head.metadata.is_primary() {
        return Err(RegistryError::Invalid(format!(
            "{} is listed first but is not a primary",
            head.metadata.shard_id
        )));
    }
    let primary = head.metadata.shard_id.clone();
    for record in &records[1..] {
        if record.metadata.primary.as_ref() != Some(&primary)
            || record.metadata.replica_node_ids != head.metadata.replica_node_ids
            || record.payload != head.payload
        {
            return Err(RegistryError::Invalid(format!(
                "{} does not match primary {primary}",
                record.metadata.shard_id
            )));
        }
    }
    Ok(primary)
}

/// Last-writer-wins: older `updated_at` loses, equal timestamps fall back to
/// the root CID so every node settles on the same record.
fn is_stale(incoming: &ShardMetadata, current: &ShardMetadata) -> bool {
    (incoming.updated_at, incoming.root_cid) < (current.updated_at, current.root_cid)
}

fn sequence_of(shard_id: &ShardId) -> Option<u64> {
    shard_id.as_str().rsplit('/').next()?.parse().ok()
}
