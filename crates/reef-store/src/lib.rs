//! Durable, content-addressed storage for shard payloads.
//!
//! This crate defines the [`DurableStore`] trait, which every node uses to
//! persist encoded shard payloads, along with:
//!
//! - [`MemoryStore`]: in-memory blobs behind a `RwLock<HashMap>`.
//! - [`FaultyStore`]: a wrapper injecting latency and failures for tests.
//! - [`StorePool`]: the per-node store lookup used by the coordinator.

mod error;
mod faulty_store;
mod memory_store;
mod pool;
mod traits;

pub use error::StoreError;
pub use faulty_store::FaultyStore;
pub use memory_store::MemoryStore;
pub use pool::StorePool;
pub use traits::{DurableStore, StorageCapacity};
