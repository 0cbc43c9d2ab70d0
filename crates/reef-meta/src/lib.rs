//! Metadata persistence layer wrapping Fjall.
//!
//! [`MetaStore`] provides typed accessors over three Fjall keyspaces that
//! let the shard registry survive restarts:
//!
//! - `shards`: [`ShardId`](reef_types::ShardId) → serialized [`ShardMetadata`](reef_types::ShardMetadata)
//! - `items`: [`ItemId`](reef_types::ItemId) → serialized [`ItemLocation`](reef_types::ItemLocation)
//! - `repair_queue`: priority ++ [`ShardId`](reef_types::ShardId) → shard id (lowest first)
//!
//! Shard payloads are not stored here. Every member of a shard set holds
//! the same items, so payloads are rebuilt from `items` on load.

mod error;
mod store;

pub use error::MetaError;
pub use store::MetaStore;
