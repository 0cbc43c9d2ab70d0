//! Error types for the engine.

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Placement, write quorum, migration or repair failure.
    #[error("coordinator error: {0}")]
    Coord(#[from] reef_coord::CoordError),

    /// The query could not be planned.
    #[error("query error: {0}")]
    Query(#[from] reef_query::QueryError),

    /// Failed to load the durable registry.
    #[error("registry error: {0}")]
    Registry(#[from] reef_registry::RegistryError),

    /// Failed to open the metadata store.
    #[error("metadata error: {0}")]
    Meta(#[from] reef_meta::MetaError),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
