//! Capability interfaces for the collaborators a search depends on, plus
//! in-memory implementations used by single-process deployments and tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use reef_types::ItemId;

use crate::error::QueryError;

pub type Embedding = Vec<f32>;

/// Turns query text into a vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Fails with [`QueryError::EmbeddingUnavailable`] when no vector can
    /// be produced.
    async fn embed(&self, text: &str) -> Result<Embedding, QueryError>;
}

/// Stored item vectors.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// The item's vector, `None` if the item has none.
    async fn vector(&self, item_id: &ItemId) -> Result<Option<Embedding>, QueryError>;

    /// Similarity in `[0, 1]`. Cosine similarity mapped from `[-1, 1]`.
    fn similarity(&self, query: &[f32], candidate: &[f32]) -> f32 {
        cosine_unit(query, candidate)
    }
}

/// Item adjacency.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Neighbors of `item_id`, optionally restricted to `relations`.
    async fn neighbors(
        &self,
        item_id: &ItemId,
        relations: Option<&[String]>,
    ) -> Result<Vec<ItemId>, QueryError>;
}

/// Cosine similarity rescaled to `[0, 1]`; zero for empty, mismatched or
/// zero-length vectors.
pub fn cosine_unit(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let cos = dot / (na.sqrt() * nb.sqrt());
    if !cos.is_finite() {
        return 0.0;
    }
    ((cos + 1.0) / 2.0).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// In-memory backends
// ---------------------------------------------------------------------------

/// Fixed text-to-vector table.
#[derive(Debug, Default)]
pub struct MemoryEmbeddings {
    table: RwLock<HashMap<String, Embedding>>,
}

impl MemoryEmbeddings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, text: impl Into<String>, vector: Embedding) {
        self.table
            .write()
            .expect("embedding lock poisoned")
            .insert(text.into(), vector);
    }
}

#[async_trait]
impl EmbeddingProvider for MemoryEmbeddings {
    async fn embed(&self, text: &str) -> Result<Embedding, QueryError> {
        self.table
            .read()
            .expect("embedding lock poisoned")
            .get(text)
            .cloned()
            .ok_or_else(|| QueryError::EmbeddingUnavailable(format!("no vector for {text:?}")))
    }
}

/// Item vectors held in a map.
#[derive(Debug, Default)]
pub struct MemoryVectors {
    vectors: RwLock<HashMap<ItemId, Embedding>>,
}

impl MemoryVectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item_id: ItemId, vector: Embedding) {
        self.vectors
            .write()
            .expect("vector lock poisoned")
            .insert(item_id, vector);
    }

    pub fn len(&self) -> usize {
        self.vectors.read().expect("vector lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorBackend for MemoryVectors {
    async fn vector(&self, item_id: &ItemId) -> Result<Option<Embedding>, QueryError> {
        Ok(self
            .vectors
            .read()
            .expect("vector lock poisoned")
            .get(item_id)
            .cloned())
    }
}

/// Labeled directed edges.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    edges: RwLock<HashMap<ItemId, BTreeSet<(String, ItemId)>>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `from -> to` edge labeled `relation`.
    pub fn link(&self, from: ItemId, relation: impl Into<String>, to: ItemId) {
        self.edges
            .write()
            .expect("graph lock poisoned")
            .entry(from)
            .or_default()
            .insert((relation.into(), to));
    }
}

#[async_trait]
impl GraphBackend for MemoryGraph {
    async fn neighbors(
        &self,
        item_id: &ItemId,
        relations: Option<&[String]>,
    ) -> Result<Vec<ItemId>, QueryError> {
        let edges = self.edges.read().expect("graph lock poisoned");
        let Some(out) = edges.get(item_id) else {
            return Ok(Vec::new());
        };
        let mut neighbors: Vec<ItemId> = out
            .iter()
            .filter(|(rel, _)| relations.is_none_or(|allowed| allowed.contains(rel)))
            .map(|(_, to)| to.clone())
            .collect();
        neighbors.sort();
        neighbors.dedup();
        Ok(neighbors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_unit_range() {
        assert!((cosine_unit(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_unit(&[1.0, 0.0], &[0.0, 1.0]) - 0.5).abs() < 1e-6);
        assert!(cosine_unit(&[1.0, 0.0], &[-1.0, 0.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_unit_degenerate_inputs() {
        assert_eq!(cosine_unit(&[], &[]), 0.0);
        assert_eq!(cosine_unit(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_unit(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_unit(&[f32::NAN, 1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_missing_embedding_is_typed_failure() {
        let embeddings = MemoryEmbeddings::new();
        embeddings.insert("known", vec![1.0]);
        assert_eq!(embeddings.embed("known").await.unwrap(), vec![1.0]);
        assert!(matches!(
            embeddings.embed("unknown").await,
            Err(QueryError::EmbeddingUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_neighbors_filter_by_relation() {
        let graph = MemoryGraph::new();
        let a = ItemId::from("a");
        graph.link(a.clone(), "cites", ItemId::from("c"));
        graph.link(a.clone(), "mentions", ItemId::from("b"));
        graph.link(a.clone(), "cites", ItemId::from("b"));

        let all = graph.neighbors(&a, None).await.unwrap();
        assert_eq!(all, vec![ItemId::from("b"), ItemId::from("c")]);

        let cites = ["cites".to_string()];
        let filtered = graph.neighbors(&a, Some(&cites)).await.unwrap();
        assert_eq!(filtered, vec![ItemId::from("b"), ItemId::from("c")]);

        let mentions = ["mentions".to_string()];
        let filtered = graph.neighbors(&a, Some(&mentions)).await.unwrap();
        assert_eq!(filtered, vec![ItemId::from("b")]);

        assert!(graph.neighbors(&ItemId::from("z"), None).await.unwrap().is_empty());
    }
}
