//! Error types for durable storage operations.

use reef_types::{Cid, NodeId};

/// Errors that can occur while storing or reading payloads.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested blob was not found.
    #[error("blob not found: {0}")]
    NotFound(Cid),

    /// The store has reached its capacity limit.
    #[error("store capacity exceeded: need {needed} bytes, only {available} available")]
    CapacityExceeded {
        /// Bytes needed for the operation.
        needed: u64,
        /// Bytes currently available.
        available: u64,
    },

    /// No store is registered for the node.
    #[error("no store registered for node {0}")]
    NoStore(NodeId),

    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
