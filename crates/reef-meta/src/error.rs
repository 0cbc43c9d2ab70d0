//! Error types for registry persistence.

/// Errors returned by [`MetaStore`](crate::MetaStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("fjall: {0}")]
    Fjall(#[from] fjall::Error),

    /// Raised by Fjall guard reads.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encoding: {0}")]
    Encoding(#[from] postcard::Error),

    /// A persisted key or id is not in the layout this store writes.
    #[error("malformed {keyspace} entry: {reason}")]
    Malformed {
        keyspace: &'static str,
        reason: String,
    },
}
