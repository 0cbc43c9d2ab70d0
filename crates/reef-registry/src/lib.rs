//! Authoritative shard bookkeeping.
//!
//! [`ShardRegistry`] owns every [`ShardRecord`] (metadata, item payload and
//! rebalance state) plus the item → primary shard index. Each record sits in
//! its own slot: writers lock the record, and before unlocking they publish
//! a metadata snapshot that lookups and listings read instead. A primary →
//! members index lets set operations find their records without touching
//! any other set.
//!
//! Multi-shard changes (writes, promotions, split and merge flips) lock every
//! member of the affected sets in shard-id order. While holding them they
//! may briefly take the item index, the set index or the outer map, never
//! the other way round. Meta store writes happen after the record locks are
//! released.

mod error;
mod registry;

pub use error::RegistryError;
pub use registry::{DetachOutcome, MergeCommit, ShardRecord, ShardRegistry, SplitCommit};
