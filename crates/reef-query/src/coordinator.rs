//! Distributed query execution.
//!
//! [`QueryCoordinator::execute`] resolves the query vector, asks the
//! [`ShardCoordinator`] for the target shard sets and searches them with a
//! bounded fan-out: at most `fan_out_limit` replica searches of one query
//! are in flight at any time. Each shard is read from its healthy replicas
//! in placement order until `read_quorum` of them answered; a replica that
//! fails is replaced by the next one. Shard failures never fail the query:
//! they are listed in the response, which is then marked partial.
//!
//! Replica searches stop themselves at their slice deadline and return
//! what they collected. The coordinator only abandons a replica that is
//! still silent a short grace period after that, or past the query deadline,
//! whichever is later.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use reef_coord::{ReplicaTarget, ShardCoordinator, ShardTarget};
use reef_types::{QueryConfig, QueryScope, ShardId};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{Embedding, EmbeddingProvider};
use crate::budget::{BudgetExhausted, BudgetLimits, BudgetManager, BudgetResource};
use crate::cache::{CacheStatus, EmbeddingCache};
use crate::client::{ReplicaClient, ShardSearchRequest};
use crate::engine::SearchOutcome;
use crate::error::QueryError;
use crate::merge::{ScoredItem, merge_ranked};

/// How long a replica may overrun its slice deadline before it is abandoned.
const REPLICA_GRACE: Duration = Duration::from_millis(50);

/// What the caller searches with.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    /// Embedded through the provider, cached by text.
    Text(String),
    /// Used as is.
    Embedding(Embedding),
}

/// One query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: QueryInput,
    pub scope: QueryScope,
    pub top_k: usize,
    pub limits: BudgetLimits,
}

impl QueryRequest {
    /// A query with default budget limits.
    pub fn new(query: QueryInput, scope: QueryScope, top_k: usize) -> Self {
        Self {
            query,
            scope,
            top_k,
            limits: BudgetLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: BudgetLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// How results were scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScoringMode {
    Hybrid,
    /// No query vector was available; similarity weight forced to zero.
    GraphOnly,
}

/// Counters describing one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub shards_queried: usize,
    pub shards_failed: usize,
    pub replicas_contacted: usize,
    pub replica_failures: usize,
    pub nodes_visited: u64,
    pub hops_used: u32,
    pub elapsed: Duration,
    pub cache: CacheStatus,
    pub scoring_mode: ScoringMode,
    pub results_returned: usize,
    /// The first limit a shard search ran into, if any.
    pub budget_exhausted: Option<BudgetResource>,
}

/// Ranked results plus what it took to produce them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub results: Vec<ScoredItem>,
    /// Some shard failed or the budget cut the search short.
    pub partial: bool,
    /// Primary ids of shards that did not reach read quorum.
    pub failed_shards: Vec<ShardId>,
    pub stats: ExecutionStats,
}

/// Per-shard result of the gather phase.
struct ShardOutcome {
    primary: ShardId,
    lists: Vec<Vec<ScoredItem>>,
    contacted: usize,
    failures: usize,
    hops_used: u32,
    exhausted: Option<BudgetExhausted>,
    /// Set when fewer than `read_quorum` replicas answered.
    error: Option<QueryError>,
}

/// Scatter-gathers shard searches and merges their results.
pub struct QueryCoordinator {
    coord: Arc<ShardCoordinator>,
    client: Arc<dyn ReplicaClient>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    cache: EmbeddingCache,
    config: QueryConfig,
    read_quorum: usize,
}

impl QueryCoordinator {
    /// Read quorum comes from the coordinator's quorum settings.
    pub fn new(coord: Arc<ShardCoordinator>, client: Arc<dyn ReplicaClient>, config: QueryConfig) -> Self {
        let read_quorum = coord.config().quorum.read_quorum.max(1);
        Self {
            coord,
            client,
            embedder: None,
            cache: EmbeddingCache::new(config.embedding_cache_entries),
            config,
            read_quorum,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Run `request` across its target shards.
    ///
    /// Fails only when the target shards cannot be determined (for example
    /// an unassigned item scope). Everything past planning is recorded in
    /// the response.
    #[tracing::instrument(skip_all, fields(top_k = request.top_k))]
    pub async fn execute(&self, request: QueryRequest) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        let budget = BudgetManager::new(request.limits);

        let (embedding, cache) = self.resolve_embedding(&request.query, &budget).await;
        let scoring_mode = if embedding.is_some() {
            ScoringMode::Hybrid
        } else {
            ScoringMode::GraphOnly
        };

        let targets = self.coord.query_targets(&request.scope)?;
        let shards_queried = targets.len();
        debug!(shards = shards_queried, ?scoring_mode, "fanning out");

        let fan_out = self.config.fan_out_limit.max(1);
        let permits = Semaphore::new(fan_out);
        let outcomes: Vec<ShardOutcome> = stream::iter(targets)
            .map(|target| self.search_shard(target, embedding.clone(), &budget, &permits))
            .buffer_unordered(fan_out)
            .collect()
            .await;

        let mut failed_shards = Vec::new();
        let mut lists = Vec::new();
        let mut replicas_contacted = 0;
        let mut replica_failures = 0;
        let mut hops_used = 0;
        let mut exhausted = None;
        for outcome in outcomes {
            replicas_contacted += outcome.contacted;
            replica_failures += outcome.failures;
            hops_used += outcome.hops_used;
            exhausted = exhausted.or(outcome.exhausted);
            if let Some(e) = outcome.error {
                warn!(shard_id = %outcome.primary, error = %e, "shard search failed");
                failed_shards.push(outcome.primary);
            }
            lists.extend(outcome.lists);
        }
        failed_shards.sort();
        let exhausted = exhausted.or(budget.exhaustion());

        let top_k = request.top_k.min(request.limits.max_results);
        let mut results = merge_ranked(lists, top_k);
        results.truncate(budget.record_results(results.len()));

        let partial = !failed_shards.is_empty() || exhausted.is_some();
        let stats = ExecutionStats {
            shards_queried,
            shards_failed: failed_shards.len(),
            replicas_contacted,
            replica_failures,
            nodes_visited: budget.snapshot().nodes_visited,
            hops_used,
            elapsed: started.elapsed(),
            cache,
            scoring_mode,
            results_returned: results.len(),
            budget_exhausted: exhausted.map(|e| e.resource),
        };
        info!(
            results = stats.results_returned,
            shards = shards_queried,
            failed = stats.shards_failed,
            nodes = stats.nodes_visited,
            partial,
            "query executed"
        );
        Ok(QueryResponse {
            results,
            partial,
            failed_shards,
            stats,
        })
    }

    /// Embed the query, or `None` to fall back to graph-only scoring.
    async fn resolve_embedding(
        &self,
        input: &QueryInput,
        budget: &BudgetManager,
    ) -> (Option<Arc<Embedding>>, CacheStatus) {
        let text = match input {
            QueryInput::Embedding(vector) if vector.is_empty() => return (None, CacheStatus::Bypass),
            QueryInput::Embedding(vector) => return (Some(Arc::new(vector.clone())), CacheStatus::Bypass),
            QueryInput::Text(text) => text,
        };
        if let Some(hit) = self.cache.get(text) {
            return (Some(hit), CacheStatus::Hit);
        }
        let Some(embedder) = &self.embedder else {
            warn!("no embedding provider, scoring graph-only");
            return (None, CacheStatus::Miss);
        };

        match tokio::time::timeout_at(budget.deadline(), embedder.embed(text)).await {
            Ok(Ok(vector)) if !vector.is_empty() => {
                let vector = Arc::new(vector);
                self.cache.put(text, vector.clone());
                (Some(vector), CacheStatus::Miss)
            }
            Ok(Ok(_)) => {
                warn!("provider returned an empty embedding, scoring graph-only");
                (None, CacheStatus::Miss)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "embedding unavailable, scoring graph-only");
                (None, CacheStatus::Miss)
            }
            Err(_) => {
                warn!("embedding timed out, scoring graph-only");
                (None, CacheStatus::Miss)
            }
        }
    }

    /// Read one shard set until `read_quorum` replicas answered or every
    /// healthy replica was tried.
    async fn search_shard(
        &self,
        target: ShardTarget,
        query: Option<Arc<Embedding>>,
        budget: &Arc<BudgetManager>,
        permits: &Semaphore,
    ) -> ShardOutcome {
        let mut outcome = ShardOutcome {
            primary: target.primary.clone(),
            lists: Vec::new(),
            contacted: 0,
            failures: 0,
            hops_used: 0,
            exhausted: None,
            error: None,
        };

        let reserve = self.config.merge_reserve.clamp(0.0, 1.0);
        let deadline = Instant::now() + budget.remaining_time().mul_f64(1.0 - reserve);
        let backstop = budget.deadline().max(deadline + REPLICA_GRACE);
        let required = self.read_quorum;
        let mut answered = 0;
        let mut last_error = None;
        let mut remaining = target.replicas.iter();

        while answered < required {
            let wave: Vec<&ReplicaTarget> = remaining.by_ref().take(required - answered).collect();
            if wave.is_empty() {
                break;
            }
            if outcome.contacted > 0 && Instant::now() >= deadline {
                break;
            }
            outcome.contacted += wave.len();

            let searches = wave.iter().map(|replica| {
                let request = ShardSearchRequest {
                    shard_id: replica.shard_id.clone(),
                    collection: target.collection.clone(),
                    query: query.clone(),
                    seeds: target.seeds.clone(),
                };
                self.search_replica(replica, request, budget.slice(deadline), backstop, permits)
            });
            for (replica, result) in wave.iter().zip(futures::future::join_all(searches).await) {
                match result {
                    Ok(found) => {
                        answered += 1;
                        outcome.hops_used += found.hops_used;
                        outcome.exhausted = outcome.exhausted.or(found.exhausted);
                        outcome.lists.push(found.results);
                    }
                    Err(e) => {
                        outcome.failures += 1;
                        debug!(shard_id = %replica.shard_id, node_id = %replica.node_id, error = %e, "replica search failed");
                        last_error = Some(e);
                    }
                }
            }
        }

        if answered < required {
            outcome.error = Some(last_error.unwrap_or_else(|| {
                QueryError::Backend(format!(
                    "{answered} of {required} replicas answered for {}",
                    target.primary
                ))
            }));
        }
        outcome
    }

    /// One replica search under a fan-out permit. The search is expected to
    /// honour `slice` itself; `backstop` only catches transports that never
    /// return.
    async fn search_replica(
        &self,
        replica: &ReplicaTarget,
        request: ShardSearchRequest,
        slice: Arc<BudgetManager>,
        backstop: Instant,
        permits: &Semaphore,
    ) -> Result<SearchOutcome, QueryError> {
        let _permit = match tokio::time::timeout_at(slice.deadline(), permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(QueryError::Backend("fan-out limiter closed".into())),
            Err(_) => return Err(QueryError::Timeout(replica.shard_id.clone())),
        };
        if slice.is_cancelled() {
            return Err(BudgetExhausted {
                resource: BudgetResource::Cancelled,
            }
            .into());
        }
        let search = self.client.search(&replica.node_id, &request, &slice);
        match tokio::time::timeout_at(backstop, search).await {
            Ok(result) => result,
            Err(_) => {
                warn!(shard_id = %replica.shard_id, node_id = %replica.node_id, "replica ignored its deadline, abandoned");
                Err(QueryError::Timeout(replica.shard_id.clone()))
            }
        }
    }
}
