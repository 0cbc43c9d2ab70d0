//! Single-shard hybrid search.
//!
//! Seeds are visited first, then the graph is expanded breadth-first one
//! hop per level. Every level costs one hop and every newly reached item
//! one visited node; the search stops expanding at the first refused
//! charge and scores what it has.
//!
//! Backend calls are awaited through [`BudgetManager::bounded`], so a slow
//! graph or vector store cannot hold the search past its deadline. Once
//! time runs out, items still waiting for their vector are scored on graph
//! proximity alone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use reef_types::ItemId;
use tracing::debug;

use crate::backend::{GraphBackend, VectorBackend};
use crate::budget::{BudgetExhausted, BudgetManager};
use crate::error::QueryError;
use crate::merge::{ScoredItem, rank_order};

/// Result of one shard search.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    /// Ranked by score descending, then item id.
    pub results: Vec<ScoredItem>,
    pub hops_used: u32,
    pub nodes_visited: u64,
    /// Set when expansion stopped on a refused charge.
    pub exhausted: Option<BudgetExhausted>,
}

/// Scores candidates of one shard by vector similarity and graph proximity.
pub struct HybridSearchEngine {
    vectors: Arc<dyn VectorBackend>,
    graph: Arc<dyn GraphBackend>,
    alpha: f32,
    relations: Option<Vec<String>>,
}

impl HybridSearchEngine {
    pub fn new(vectors: Arc<dyn VectorBackend>, graph: Arc<dyn GraphBackend>, alpha: f32) -> Self {
        Self {
            vectors,
            graph,
            alpha: alpha.clamp(0.0, 1.0),
            relations: None,
        }
    }

    /// Only follow edges with these relation labels.
    pub fn with_relations(mut self, relations: Vec<String>) -> Self {
        self.relations = Some(relations);
        self
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Search from `seeds`. Without a query vector, scoring is graph-only.
    pub async fn search(
        &self,
        query: Option<&[f32]>,
        seeds: &[ItemId],
        budget: &BudgetManager,
    ) -> Result<SearchOutcome, QueryError> {
        let mut outcome = SearchOutcome::default();
        // Raw proximity per visited item.
        let mut visited: BTreeMap<ItemId, f32> = BTreeMap::new();
        let mut frontier: BTreeSet<ItemId> = BTreeSet::new();

        for seed in seeds.iter().collect::<BTreeSet<_>>() {
            if let Err(exhausted) = budget.charge(0, 1) {
                outcome.exhausted = Some(exhausted);
                break;
            }
            outcome.nodes_visited += 1;
            visited.insert(seed.clone(), 0.0);
            frontier.insert(seed.clone());
        }

        let mut hop = 0u32;
        while outcome.exhausted.is_none() && !frontier.is_empty() && hop < budget.limits().max_hops {
            if let Err(exhausted) = budget.charge(1, 0) {
                outcome.exhausted = Some(exhausted);
                break;
            }
            hop += 1;
            outcome.hops_used += 1;
            let weight = 0.5f32.powi(hop as i32 - 1);

            let mut next = BTreeSet::new();
            'expand: for item in &frontier {
                let neighbors = match budget
                    .bounded(self.graph.neighbors(item, self.relations.as_deref()))
                    .await
                {
                    Ok(found) => found?,
                    Err(exhausted) => {
                        outcome.exhausted = Some(exhausted);
                        break 'expand;
                    }
                };
                for neighbor in neighbors {
                    if let Some(proximity) = visited.get_mut(&neighbor) {
                        *proximity += weight;
                        continue;
                    }
                    if let Err(exhausted) = budget.charge(0, 1) {
                        outcome.exhausted = Some(exhausted);
                        break 'expand;
                    }
                    outcome.nodes_visited += 1;
                    visited.insert(neighbor.clone(), weight);
                    next.insert(neighbor);
                }
            }
            frontier = next;
        }

        if let Some(exhausted) = &outcome.exhausted {
            debug!(resource = %exhausted.resource, hops = outcome.hops_used, nodes = outcome.nodes_visited, "search truncated");
        }

        let alpha = if query.is_some() { self.alpha } else { 0.0 };
        let max_proximity = visited.values().copied().fold(0.0f32, f32::max);
        let mut results = Vec::with_capacity(visited.len());
        let mut out_of_time = false;
        for (item_id, raw) in visited {
            let similarity = match query {
                Some(query) if !out_of_time => {
                    match budget.bounded(self.vectors.vector(&item_id)).await {
                        Ok(found) => found?
                            .map(|candidate| self.vectors.similarity(query, &candidate))
                            .unwrap_or(0.0),
                        Err(exhausted) => {
                            outcome.exhausted.get_or_insert(exhausted);
                            out_of_time = true;
                            0.0
                        }
                    }
                }
                _ => 0.0,
            };
            let proximity = if max_proximity > 0.0 {
                raw / max_proximity
            } else {
                0.0
            };
            results.push(ScoredItem::combine(item_id, similarity, proximity, alpha));
        }
        results.sort_unstable_by(rank_order);
        results.truncate(budget.limits().max_results);
        outcome.results = results;
        Ok(outcome)
    }
}
