//! Per-query resource accounting.
//!
//! A [`BudgetManager`] owns the counters of one query. Counters only move
//! through [`BudgetManager::charge`], which refuses any charge that would
//! push a counter past its limit. The first refusal is sticky: every later
//! charge fails with the same [`BudgetExhausted`] and the counters stay
//! where they were.
//!
//! Shard searches run on a [`slice`](BudgetManager::slice) of the query
//! budget: a child with its own deadline and hop allowance whose visited
//! nodes are also charged to the parent, so the node cap holds across the
//! whole fan-out. Cancelling a manager cancels every slice cut from it.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Caller-supplied caps for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    /// Graph expansion depth beyond the seed candidates.
    pub max_hops: u32,
    /// Items scored or expanded, across every shard of the query.
    pub max_nodes_visited: u64,
    pub max_results: usize,
    /// Wall-clock allowance from query start.
    pub time_limit: Duration,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_hops: 2,
            max_nodes_visited: 1_000,
            max_results: 100,
            time_limit: Duration::from_secs(2),
        }
    }
}

/// The limit a refused charge ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BudgetResource {
    Hops,
    NodesVisited,
    Deadline,
    Cancelled,
}

impl fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hops => "hop limit",
            Self::NodesVisited => "node visit limit",
            Self::Deadline => "deadline",
            Self::Cancelled => "cancellation",
        })
    }
}

/// A charge was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("query budget exhausted: {resource}")]
pub struct BudgetExhausted {
    pub resource: BudgetResource,
}

/// Snapshot of a budget's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryBudget {
    pub hops_used: u32,
    pub nodes_visited: u64,
    pub results_collected: usize,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    hops_used: u32,
    nodes_visited: u64,
    results_collected: usize,
    exhausted: Option<BudgetExhausted>,
}

/// Enforces one query's (or one shard slice's) limits.
#[derive(Debug)]
pub struct BudgetManager {
    limits: BudgetLimits,
    deadline: Instant,
    counters: Mutex<Counters>,
    cancel: watch::Sender<bool>,
    parent: Option<Arc<BudgetManager>>,
}

impl BudgetManager {
    /// Start a budget whose deadline is `limits.time_limit` from now.
    pub fn new(limits: BudgetLimits) -> Arc<Self> {
        Self::with_deadline(limits, Instant::now() + limits.time_limit)
    }

    /// Start a budget with an explicit absolute deadline.
    pub fn with_deadline(limits: BudgetLimits, deadline: Instant) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            limits,
            deadline,
            counters: Mutex::new(Counters::default()),
            cancel,
            parent: None,
        })
    }

    /// Cut a child budget for one shard search.
    ///
    /// The child's deadline is the earlier of `deadline` and this budget's.
    /// It gets a fresh hop allowance; nodes it visits count against this
    /// budget too.
    pub fn slice(self: &Arc<Self>, deadline: Instant) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            limits: self.limits,
            deadline: deadline.min(self.deadline),
            counters: Mutex::new(Counters::default()),
            cancel,
            parent: Some(self.clone()),
        })
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Consume `hops` and `nodes`, or fail without changing any counter.
    pub fn charge(&self, hops: u32, nodes: u64) -> Result<(), BudgetExhausted> {
        let mut counters = self.counters.lock().expect("budget lock poisoned");
        if let Some(exhausted) = counters.exhausted {
            return Err(exhausted);
        }

        let refused = if self.is_cancelled() {
            Some(BudgetResource::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(BudgetResource::Deadline)
        } else if counters.hops_used.saturating_add(hops) > self.limits.max_hops {
            Some(BudgetResource::Hops)
        } else if counters.nodes_visited.saturating_add(nodes) > self.limits.max_nodes_visited {
            Some(BudgetResource::NodesVisited)
        } else {
            None
        };
        let parent_refusal = match (&refused, &self.parent) {
            (None, Some(parent)) if nodes > 0 => parent.charge(0, nodes).err(),
            _ => None,
        };

        if let Some(exhausted) = refused
            .map(|resource| BudgetExhausted { resource })
            .or(parent_refusal)
        {
            debug!(resource = %exhausted.resource, hops = counters.hops_used, nodes = counters.nodes_visited, "budget exhausted");
            counters.exhausted = Some(exhausted);
            return Err(exhausted);
        }

        counters.hops_used += hops;
        counters.nodes_visited += nodes;
        Ok(())
    }

    /// Count `count` collected results and return how many fit under
    /// `max_results`.
    pub fn record_results(&self, count: usize) -> usize {
        let mut counters = self.counters.lock().expect("budget lock poisoned");
        let room = self
            .limits
            .max_results
            .saturating_sub(counters.results_collected);
        let accepted = count.min(room);
        counters.results_collected += accepted;
        accepted
    }

    /// Time left before the deadline; zero once cancelled.
    pub fn remaining_time(&self) -> Duration {
        if self.is_cancelled() {
            return Duration::ZERO;
        }
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Await `work` unless the deadline passes or the budget is cancelled
    /// first. Either refusal is recorded like a refused charge and returned.
    ///
    /// Node and hop exhaustion do not stop `work`: scoring what was already
    /// visited stays allowed until time runs out.
    pub async fn bounded<F: Future>(&self, work: F) -> Result<F::Output, BudgetExhausted> {
        if self.is_cancelled() {
            return Err(self.refuse(BudgetResource::Cancelled));
        }
        if Instant::now() >= self.deadline {
            return Err(self.refuse(BudgetResource::Deadline));
        }
        tokio::select! {
            output = work => Ok(output),
            _ = tokio::time::sleep_until(self.deadline) => Err(self.refuse(BudgetResource::Deadline)),
            _ = self.cancelled() => Err(self.refuse(BudgetResource::Cancelled)),
        }
    }

    fn refuse(&self, resource: BudgetResource) -> BudgetExhausted {
        let refused = BudgetExhausted { resource };
        let mut counters = self.counters.lock().expect("budget lock poisoned");
        if counters.exhausted.is_none() {
            debug!(%resource, "budget exhausted while waiting");
            counters.exhausted = Some(refused);
        }
        refused
    }

    /// The refusal that exhausted this budget, if any.
    pub fn exhaustion(&self) -> Option<BudgetExhausted> {
        self.counters.lock().expect("budget lock poisoned").exhausted
    }

    pub fn snapshot(&self) -> QueryBudget {
        let counters = self.counters.lock().expect("budget lock poisoned");
        QueryBudget {
            hops_used: counters.hops_used,
            nodes_visited: counters.nodes_visited,
            results_collected: counters.results_collected,
            deadline: self.deadline,
        }
    }

    /// Cancel this budget and every slice cut from it.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolve once this budget or one of its ancestors is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers = Vec::new();
        let mut current = Some(self);
        while let Some(budget) = current {
            receivers.push(budget.cancel.subscribe());
            current = budget.parent.as_deref();
        }
        let waits = receivers.iter_mut().map(|rx| {
            Box::pin(async move {
                // Senders live as long as their manager, which outlives `self`.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        futures::future::select_all(waits).await;
    }
}
