//! Error types for placement.

/// Errors returned by [`HashRing`](crate::HashRing) lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// The ring has no nodes to place a key on.
    #[error("no nodes available on the hash ring")]
    NoNodesAvailable,
}
