//! Core trait and types for durable storage.

use bytes::Bytes;
use reef_types::{Cid, ShardId};

use crate::error::StoreError;

/// Capacity information for a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCapacity {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/// Content-addressed blob storage for encoded shard payloads.
///
/// `put` returns the BLAKE3 CID of the stored bytes. Blobs are reference
/// counted per shard: identical payloads written by two shards share one
/// blob, and `delete` only drops the blob once no shard references it.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync {
    /// Store `payload` on behalf of `shard_id` and return its CID.
    async fn put(&self, shard_id: &ShardId, payload: Bytes) -> Result<Cid, StoreError>;

    /// Retrieve a blob by CID. Returns `None` if not found.
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, StoreError>;

    /// Drop `shard_id`'s reference to `cid`.
    async fn delete(&self, shard_id: &ShardId, cid: &Cid) -> Result<(), StoreError>;

    /// Check whether a blob exists.
    async fn contains(&self, cid: &Cid) -> Result<bool, StoreError>;

    /// List all stored CIDs.
    async fn list(&self) -> Result<Vec<Cid>, StoreError>;

    /// Report current storage capacity.
    async fn capacity(&self) -> Result<StorageCapacity, StoreError>;

    /// Re-hash a stored blob and compare it to its CID.
    async fn verify(&self, cid: &Cid) -> Result<bool, StoreError>;
}
