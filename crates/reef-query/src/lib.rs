//! Budgeted query execution for Reef.
//!
//! - [`BudgetManager`] enforces per-query caps on hops, visited nodes,
//!   results and wall-clock time.
//! - [`HybridSearchEngine`] runs one shard's search, combining vector
//!   similarity with graph proximity.
//! - [`QueryCoordinator`] fans a query out over the shard sets chosen by the
//!   [`ShardCoordinator`](reef_coord::ShardCoordinator), tolerates failed
//!   shards and merges the ranked lists.
//!
//! Embedding, vector and graph backends plug in through the traits in
//! [`backend`]; replica transport through [`ReplicaClient`].

pub mod backend;
pub mod budget;
pub mod cache;
pub mod client;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod merge;

pub use backend::{
    Embedding, EmbeddingProvider, GraphBackend, MemoryEmbeddings, MemoryGraph, MemoryVectors,
    VectorBackend,
};
pub use budget::{BudgetExhausted, BudgetLimits, BudgetManager, BudgetResource, QueryBudget};
pub use cache::{CacheStatus, EmbeddingCache};
pub use client::{LocalReplicaClient, ReplicaClient, ShardSearchRequest};
pub use coordinator::{
    ExecutionStats, QueryCoordinator, QueryInput, QueryRequest, QueryResponse, ScoringMode,
};
pub use engine::{HybridSearchEngine, SearchOutcome};
pub use error::QueryError;
pub use merge::{ScoredItem, merge_ranked};
