//! In-memory durable store.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use bytes::Bytes;
use reef_types::{Cid, ShardId};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{DurableStore, StorageCapacity};

struct Blob {
    data: Bytes,
    owners: BTreeSet<ShardId>,
}

/// In-memory store backed by a `RwLock<HashMap>`.
///
/// Tracks total bytes stored against a configurable maximum.
pub struct MemoryStore {
    blobs: RwLock<HashMap<Cid, Blob>>,
    max_bytes: u64,
}

impl MemoryStore {
    /// Create a new in-memory store with the given capacity limit.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    /// Overwrite a blob's bytes without updating its CID.
    #[cfg(test)]
    pub(crate) fn tamper(&self, cid: &Cid, data: &[u8]) {
        let mut map = self.blobs.write().expect("lock poisoned");
        if let Some(blob) = map.get_mut(cid) {
            blob.data = Bytes::copy_from_slice(data);
        }
    }

    fn used_bytes_unlocked(map: &HashMap<Cid, Blob>) -> u64 {
        map.values().map(|b| b.data.len() as u64).sum()
    }
}

#[async_trait::async_trait]
impl DurableStore for MemoryStore {
    async fn put(&self, shard_id: &ShardId, payload: Bytes) -> Result<Cid, StoreError> {
        let cid = Cid::from_data(&payload);
        let mut map = self.blobs.write().expect("lock poisoned");

        if let Some(blob) = map.get_mut(&cid) {
            blob.owners.insert(shard_id.clone());
            return Ok(cid);
        }

        let used = Self::used_bytes_unlocked(&map);
        let needed = payload.len() as u64;
        if used + needed > self.max_bytes {
            return Err(StoreError::CapacityExceeded {
                needed,
                available: self.max_bytes.saturating_sub(used),
            });
        }

        debug!(%shard_id, %cid, size = payload.len(), "storing payload in memory");
        map.insert(
            cid,
            Blob {
                data: payload,
                owners: BTreeSet::from([shard_id.clone()]),
            },
        );
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        Ok(map.get(cid).map(|b| b.data.clone()))
    }

    async fn delete(&self, shard_id: &ShardId, cid: &Cid) -> Result<(), StoreError> {
        let mut map = self.blobs.write().expect("lock poisoned");
        let orphaned = match map.get_mut(cid) {
            Some(blob) => {
                blob.owners.remove(shard_id);
                blob.owners.is_empty()
            }
            None => false,
        };
        if orphaned {
            map.remove(cid);
            debug!(%shard_id, %cid, "deleted payload from memory");
        }
        Ok(())
    }

    async fn contains(&self, cid: &Cid) -> Result<bool, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        Ok(map.contains_key(cid))
    }

    async fn list(&self) -> Result<Vec<Cid>, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        Ok(map.keys().copied().collect())
    }

    async fn capacity(&self) -> Result<StorageCapacity, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        let used = Self::used_bytes_unlocked(&map);
        Ok(StorageCapacity {
            total_bytes: self.max_bytes,
            used_bytes: used,
            available_bytes: self.max_bytes.saturating_sub(used),
        })
    }

    async fn verify(&self, cid: &Cid) -> Result<bool, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        match map.get(cid) {
            Some(blob) => Ok(Cid::from_data(&blob.data) == *cid),
            None => Err(StoreError::NotFound(*cid)),
        }
    }
}
