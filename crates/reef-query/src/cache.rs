//! LRU cache of query embeddings keyed by query text.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

use crate::backend::Embedding;

/// How a query's embedding was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// The query carried its own vector, or had none to look up.
    Bypass,
}

/// Bounded text-to-embedding cache. A capacity of 0 disables it.
pub struct EmbeddingCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    /// Front = least recently used.
    order: VecDeque<String>,
    data: HashMap<String, Arc<Embedding>>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                order: VecDeque::new(),
                data: HashMap::new(),
            }),
        }
    }

    pub fn put(&self, text: &str, embedding: Arc<Embedding>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.data.insert(text.to_string(), embedding).is_some() {
            inner.order.retain(|t| t != text);
        }
        inner.order.push_back(text.to_string());

        while inner.data.len() > self.capacity {
            let Some(evicted) = inner.order.pop_front() else {
                break;
            };
            inner.data.remove(&evicted);
            debug!(query = %evicted, "evicted cached embedding");
        }
    }

    /// Look up `text` and promote it to most recently used.
    pub fn get(&self, text: &str) -> Option<Arc<Embedding>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let embedding = inner.data.get(text)?.clone();
        inner.order.retain(|t| t != text);
        inner.order.push_back(text.to_string());
        Some(embedding)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(x: f32) -> Arc<Embedding> {
        Arc::new(vec![x])
    }

    #[test]
    fn test_put_and_get() {
        let cache = EmbeddingCache::new(4);
        cache.put("hello", vector(1.0));
        assert_eq!(*cache.get("hello").unwrap(), vec![1.0]);
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = EmbeddingCache::new(2);
        cache.put("a", vector(1.0));
        cache.put("b", vector(2.0));
        // Touch a so b becomes the eviction candidate.
        cache.get("a");
        cache.put("c", vector(3.0));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let cache = EmbeddingCache::new(2);
        cache.put("a", vector(1.0));
        cache.put("a", vector(5.0));
        assert_eq!(cache.len(), 1);
        assert_eq!(*cache.get("a").unwrap(), vec![5.0]);
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = EmbeddingCache::new(0);
        cache.put("a", vector(1.0));
        assert!(cache.is_empty());
    }
}
