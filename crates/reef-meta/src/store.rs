//! [`MetaStore`] implementation wrapping Fjall keyspaces.

use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use reef_types::{ItemId, ItemLocation, ShardId, ShardMetadata};
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Registry persistence backed by Fjall.
pub struct MetaStore {
    #[allow(dead_code)]
    db: Database,
    /// ShardId → serialized ShardMetadata.
    shards: Keyspace,
    /// ItemId → serialized ItemLocation.
    items: Keyspace,
    /// priority (8 bytes BE) ++ ShardId → ShardId.
    repair_queue: Keyspace,
}

impl MetaStore {
    /// Open a persistent MetaStore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db)
    }

    /// Open a temporary MetaStore that is cleaned up on drop.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(std::io::Error::other)?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db)
    }

    fn init_keyspaces(db: Database) -> Result<Self> {
        let shards = db.keyspace("shards", KeyspaceCreateOptions::default)?;
        let items = db.keyspace("items", KeyspaceCreateOptions::default)?;
        let repair_queue = db.keyspace("repair_queue", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            shards,
            items,
            repair_queue,
        })
    }

    // ----- Shards -----

    /// Store a shard's metadata, keyed by its id.
    pub fn put_shard(&self, metadata: &ShardMetadata) -> Result<()> {
        let value = postcard::to_allocvec(metadata)?;
        self.shards
            .insert(metadata.shard_id.as_str().as_bytes(), value.as_slice())?;
        debug!(shard_id = %metadata.shard_id, "persisted shard metadata");
        Ok(())
    }

    pub fn get_shard(&self, id: &ShardId) -> Result<Option<ShardMetadata>> {
        match self.shards.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_shard(&self, id: &ShardId) -> Result<()> {
        self.shards.remove(id.as_str().as_bytes())?;
        debug!(shard_id = %id, "deleted shard metadata");
        Ok(())
    }

    /// All persisted shard records, in key order.
    pub fn list_shards(&self) -> Result<Vec<ShardMetadata>> {
        let mut shards = Vec::new();
        for guard in self.shards.iter() {
            let v = guard.value()?;
            shards.push(postcard::from_bytes(&v)?);
        }
        Ok(shards)
    }

    // ----- Items -----

    /// Record the primary shard and content hash of an item.
    pub fn put_item(&self, id: &ItemId, location: &ItemLocation) -> Result<()> {
        let value = postcard::to_allocvec(location)?;
        self.items.insert(id.as_str().as_bytes(), value.as_slice())?;
        Ok(())
    }

    pub fn get_item(&self, id: &ItemId) -> Result<Option<ItemLocation>> {
        match self.items.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_item(&self, id: &ItemId) -> Result<()> {
        self.items.remove(id.as_str().as_bytes())?;
        Ok(())
    }

    /// All persisted item locations, in item id order.
    pub fn list_items(&self) -> Result<Vec<(ItemId, ItemLocation)>> {
        let mut items = Vec::new();
        for guard in self.items.iter() {
            let (k, v) = guard.into_inner()?;
            items.push((ItemId::new(utf8("items", &k)?), postcard::from_bytes(&v)?));
        }
        Ok(items)
    }

    // ----- Repair queue -----

    /// Enqueue a shard set for repair (lower priority = more urgent).
    pub fn enqueue_repair(&self, id: &ShardId, priority: u64) -> Result<()> {
        let key = repair_queue_key(priority, id);
        self.repair_queue
            .insert(key.as_slice(), id.as_str().as_bytes())?;
        debug!(%id, priority, "persisted repair entry");
        Ok(())
    }

    /// Dequeue the most urgent entry.
    pub fn dequeue_repair(&self) -> Result<Option<ShardId>> {
        // Smallest key = lowest priority number.
        if let Some(guard) = self.repair_queue.first_key_value() {
            let (key, value) = guard.into_inner()?;
            self.repair_queue.remove(key.as_ref())?;
            let shard_id = ShardId::new(utf8("repair_queue", &value)?);
            Ok(Some(shard_id))
        } else {
            Ok(None)
        }
    }

    /// Drop every queued entry for `id`, whatever its priority.
    pub fn remove_repair(&self, id: &ShardId) -> Result<()> {
        let mut doomed = Vec::new();
        for guard in self.repair_queue.iter() {
            let (key, value) = guard.into_inner()?;
            if &value[..] == id.as_str().as_bytes() {
                doomed.push(key);
            }
        }
        for key in doomed {
            self.repair_queue.remove(key.as_ref())?;
        }
        Ok(())
    }

    /// Queued entries in dequeue order.
    pub fn list_repairs(&self) -> Result<Vec<(u64, ShardId)>> {
        let mut entries = Vec::new();
        for guard in self.repair_queue.iter() {
            let (key, value) = guard.into_inner()?;
            let priority: [u8; 8] = key
                .get(..8)
                .and_then(|p| p.try_into().ok())
                .ok_or_else(|| MetaError::Malformed {
                    keyspace: "repair_queue",
                    reason: format!("{}-byte key has no priority prefix", key.len()),
                })?;
            entries.push((
                u64::from_be_bytes(priority),
                ShardId::new(utf8("repair_queue", &value)?),
            ));
        }
        Ok(entries)
    }

    /// Number of queued entries. O(n) scan.
    pub fn repair_queue_len(&self) -> Result<usize> {
        let mut count = 0;
        for guard in self.repair_queue.iter() {
            let _ = guard.key()?;
            count += 1;
        }
        Ok(count)
    }
}

fn utf8(keyspace: &'static str, bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| MetaError::Malformed {
        keyspace,
        reason: e.to_string(),
    })
}

/// `priority (8 bytes big-endian) ++ shard_id`, so byte order is priority order.
fn repair_queue_key(priority: u64, shard_id: &ShardId) -> Vec<u8> {
    let id = shard_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(8 + id.len());
    key.extend_from_slice(&priority.to_be_bytes());
    key.extend_from_slice(id);
    key
}
