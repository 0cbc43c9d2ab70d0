//! Payload copies between node stores.
//!
//! Every copy is content-checked: the store must report the expected CID,
//! and migration copies are additionally read back, re-hashed and decoded
//! before the registry is allowed to point at them.

use bytes::Bytes;
use reef_types::{Cid, NodeId, ShardId, ShardMetadata, ShardPayload};
use tracing::{debug, warn};

use crate::coordinator::ShardCoordinator;
use crate::error::CoordError;

impl ShardCoordinator {
    /// Store `bytes` for `shard_id` on `node` and check it landed intact.
    ///
    /// With `read_back`, the blob is fetched again and must hash to
    /// `expected_root` and decode as a [`ShardPayload`].
    pub(crate) async fn put_verified(
        &self,
        node: &NodeId,
        shard_id: &ShardId,
        bytes: Bytes,
        expected_root: Cid,
        read_back: bool,
    ) -> Result<(), CoordError> {
        let store = self.stores.get(node)?;
        let cid = store.put(shard_id, bytes).await?;
        if cid != expected_root {
            // Keep the store's refcounts honest before failing.
            let _ = store.delete(shard_id, &cid).await;
            return Err(CoordError::MigrationVerificationFailed {
                shard_id: shard_id.clone(),
                reason: format!("store returned {cid}, expected {expected_root}"),
            });
        }
        if !read_back {
            return Ok(());
        }

        let reason = match store.get(&cid).await? {
            None => Some("blob missing after write".to_string()),
            Some(data) if Cid::from_data(&data) != expected_root => {
                Some("blob hash does not match root".to_string())
            }
            Some(data) => ShardPayload::decode(&data)
                .err()
                .map(|e| format!("blob does not decode: {e}")),
        };
        if let Some(reason) = reason {
            let _ = store.delete(shard_id, &cid).await;
            return Err(CoordError::MigrationVerificationFailed {
                shard_id: shard_id.clone(),
                reason,
            });
        }
        debug!(%node, %shard_id, root = %expected_root, "verified copy");
        Ok(())
    }

    /// Read a set's current payload from the first member whose store
    /// returns bytes hashing to the member's recorded root.
    pub(crate) async fn fetch_verified(&self, members: &[ShardMetadata]) -> Option<(Bytes, Cid)> {
        for member in members.iter().filter(|m| m.healthy) {
            let Ok(store) = self.stores.get(&member.node_id) else {
                continue;
            };
            match store.get(&member.root_cid).await {
                Ok(Some(data)) if Cid::from_data(&data) == member.root_cid => {
                    debug!(shard_id = %member.shard_id, node = %member.node_id, "fetched payload via direct copy");
                    return Some((data, member.root_cid));
                }
                Ok(Some(_)) => {
                    warn!(shard_id = %member.shard_id, node = %member.node_id, "stored payload is corrupt");
                }
                Ok(None) => {
                    debug!(shard_id = %member.shard_id, node = %member.node_id, "member does not have payload");
                }
                Err(e) => {
                    warn!(shard_id = %member.shard_id, node = %member.node_id, error = %e, "payload fetch failed");
                }
            }
        }
        None
    }

    /// Best-effort removal of a superseded blob.
    pub(crate) async fn delete_blob(&self, node: &NodeId, shard_id: &ShardId, cid: Cid) {
        let Ok(store) = self.stores.get(node) else {
            return;
        };
        if let Err(e) = store.delete(shard_id, &cid).await {
            debug!(%node, %shard_id, error = %e, "could not drop superseded payload");
        }
    }
}
