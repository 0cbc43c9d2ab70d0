//! Shared types and identifiers for Reef.
//!
//! This crate defines the vocabulary used across the Reef workspace:
//! identifiers ([`NodeId`], [`ShardId`], [`ItemId`], [`CollectionId`], [`Cid`]),
//! shard bookkeeping ([`ShardMetadata`], [`ShardPayload`], [`RebalanceState`]),
//! cluster notifications ([`ClusterEvent`]) and configuration sections
//! ([`PlacementConfig`], [`RebalanceConfig`], [`QuorumConfig`], [`QueryConfig`]).

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod config;
pub mod events;

pub use config::{PlacementConfig, QueryConfig, QuorumConfig, RebalanceConfig};
pub use events::ClusterEvent;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an opaque string identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_name!(
    /// Opaque identifier of a physical cluster node.
    NodeId
);

define_name!(
    /// Identifier of a shard record: `{collection}/{owner}/{sequence:06}`.
    ShardId
);

define_name!(
    /// Identifier of a logical item (document, entity).
    ItemId
);

define_name!(
    /// Tenant or domain namespace grouping items.
    CollectionId
);

impl ShardId {
    /// Compose a shard identifier from its collection, owning node and a
    /// registry-local sequence number.
    pub fn compose(collection: &CollectionId, owner: &NodeId, sequence: u64) -> Self {
        Self(format!("{collection}/{owner}/{sequence:06}"))
    }
}

/// Content identifier: BLAKE3 hash of an immutable blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Cid([u8; 32]);

impl Cid {
    /// The all-zero content identifier, used before any content exists.
    pub const ZERO: Cid = Cid([0u8; 32]);

    /// Create a content identifier by hashing arbitrary data with BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Cid {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Cid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Shard data structures
// ---------------------------------------------------------------------------

/// Bookkeeping record for one shard.
///
/// Every member of a shard set (the primary and one replica per extra
/// node) carries the same `replica_node_ids`, owner first. Replica
/// records point back at their primary through `primary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub shard_id: ShardId,
    pub collection: CollectionId,
    /// Node that hosts this particular record.
    pub node_id: NodeId,
    /// `None` for a primary, the primary's id for a replica.
    pub primary: Option<ShardId>,
    pub item_count: u64,
    pub size_bytes: u64,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds, drives last-writer-wins on registration.
    pub updated_at: u64,
    /// Content hash of the encoded [`ShardPayload`].
    pub root_cid: Cid,
    pub healthy: bool,
    /// Placement of the whole set, primary owner first.
    pub replica_node_ids: Vec<NodeId>,
}

impl ShardMetadata {
    /// Build the metadata of an empty shard hosted on `node_id`.
    pub fn new(
        shard_id: ShardId,
        collection: CollectionId,
        node_id: NodeId,
        primary: Option<ShardId>,
        replica_node_ids: Vec<NodeId>,
    ) -> Self {
        let now = now_millis();
        Self {
            shard_id,
            collection,
            node_id,
            primary,
            item_count: 0,
            size_bytes: 0,
            created_at: now,
            updated_at: now,
            root_cid: Cid::ZERO,
            healthy: true,
            replica_node_ids,
        }
    }

    /// Whether this record is the primary of its set.
    pub fn is_primary(&self) -> bool {
        self.primary.is_none()
    }

    /// The primary shard of the set this record belongs to.
    pub fn primary_id(&self) -> &ShardId {
        self.primary.as_ref().unwrap_or(&self.shard_id)
    }

    /// Whether `node_id` hosts this record or appears in its placement.
    pub fn involves(&self, node_id: &NodeId) -> bool {
        &self.node_id == node_id || self.replica_node_ids.contains(node_id)
    }

    /// Refresh derived fields from the payload this record describes.
    pub fn refresh_from(&mut self, payload: &ShardPayload) -> Result<(), PayloadError> {
        self.item_count = payload.items.len() as u64;
        self.size_bytes = payload.size_bytes();
        self.root_cid = payload.root_cid()?;
        self.updated_at = now_millis().max(self.updated_at);
        Ok(())
    }
}

/// Item membership of a shard: the durable unit copied between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPayload {
    pub collection: CollectionId,
    pub items: BTreeMap<ItemId, Cid>,
}

/// Errors encoding or decoding a [`ShardPayload`].
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload codec error: {0}")]
    Codec(#[from] postcard::Error),
}

impl ShardPayload {
    pub fn new(collection: CollectionId) -> Self {
        Self {
            collection,
            items: BTreeMap::new(),
        }
    }

    /// Canonical byte encoding. Items are sorted, so equal payloads encode
    /// identically on every node.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Content hash summarising every item in the shard.
    pub fn root_cid(&self) -> Result<Cid, PayloadError> {
        Ok(Cid::from_data(&self.encode()?))
    }

    /// Approximate stored size: identifier bytes plus one CID per item.
    pub fn size_bytes(&self) -> u64 {
        self.items
            .keys()
            .map(|id| id.as_str().len() as u64 + 32)
            .sum()
    }
}

/// Where an item lives: its primary shard and its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemLocation {
    pub shard_id: ShardId,
    pub item_cid: Cid,
}

/// Per-shard rebalancing state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebalanceState {
    #[default]
    Balanced,
    SplitPending,
    Splitting,
    MergePending,
    Merging,
}

impl RebalanceState {
    /// Whether a migration is currently copying data for this shard.
    pub fn is_migrating(&self) -> bool {
        matches!(self, Self::Splitting | Self::Merging)
    }
}

/// Which shards a query should reach.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryScope {
    /// Every primary shard of a collection.
    Collection(CollectionId),
    /// The shard set holding one known item, seeded with that item.
    Item(ItemId),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
