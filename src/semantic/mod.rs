//! Text embeddings, similarity lookups and semantic deduplication.
//!
//! [`SemanticIndex`] wraps an [`Embedder`] with an exact-text cache. Every
//! lookup degrades gracefully: when the embedder fails, similarity queries
//! report "no match" and callers fall back to exact-key behaviour.

mod fastembed;

pub use self::fastembed::FastEmbedder;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

/// Default similarity at which two items count as duplicates.
pub const DEFAULT_DEDUPE_THRESHOLD: f32 = 0.95;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding backend error: {0}")]
    Backend(String),

    #[error("embedding backend returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },
}

/// Embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync + std::fmt::Debug {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

pub type Vector = Arc<[f32]>;

#[derive(Debug)]
struct EmbeddingCache {
    entries: HashMap<String, (Vector, Instant)>,
    order: VecDeque<String>,
}

/// Cached embeddings plus similarity helpers.
#[derive(Debug)]
pub struct SemanticIndex {
    embedder: Arc<dyn Embedder>,
    cache: Mutex<EmbeddingCache>,
    ttl: Duration,
    capacity: usize,
}

impl SemanticIndex {
    pub fn new(embedder: Arc<dyn Embedder>, ttl: Duration, capacity: usize) -> Self {
        Self {
            embedder,
            cache: Mutex::new(EmbeddingCache {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn cached(&self, text: &str) -> Option<Vector> {
        let cache = self.cache.lock().ok()?;
        let (vector, inserted) = cache.entries.get(text)?;
        (inserted.elapsed() < self.ttl).then(|| Arc::clone(vector))
    }

    fn remember(&self, text: &str, vector: &Vector) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        if cache
            .entries
            .insert(text.to_string(), (Arc::clone(vector), Instant::now()))
            .is_none()
        {
            cache.order.push_back(text.to_string());
        }
        while cache.entries.len() > self.capacity {
            let Some(oldest) = cache.order.pop_front() else {
                break;
            };
            cache.entries.remove(&oldest);
        }
    }

    /// Embed one text, served from the cache when possible.
    pub async fn embed(&self, text: &str) -> Result<Vector, EmbeddingError> {
        if let Some(vector) = self.cached(text) {
            return Ok(vector);
        }
        let mut vectors = self.embedder.embed_batch(vec![text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                expected: 1,
                got: vectors.len(),
            });
        }
        let vector: Vector = vectors.remove(0).into();
        self.remember(text, &vector);
        Ok(vector)
    }

    /// Like [`embed`](Self::embed) but logs and swallows failures.
    pub async fn try_embed(&self, text: &str) -> Option<Vector> {
        match self.embed(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "Embedding failed, degrading to exact matching");
                None
            }
        }
    }

    /// Embed many texts with a single backend call for the cache misses.
    /// Slots are `None` when the backend failed.
    pub async fn embed_many(&self, texts: &[String]) -> Vec<Option<Vector>> {
        let mut out: Vec<Option<Vector>> = texts.iter().map(|t| self.cached(t)).collect();
        let missing: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_none()).collect();
        if missing.is_empty() {
            return out;
        }

        let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
        match self.embedder.embed_batch(batch).await {
            Ok(vectors) if vectors.len() == missing.len() => {
                for (slot, vector) in missing.into_iter().zip(vectors) {
                    let vector: Vector = vector.into();
                    self.remember(&texts[slot], &vector);
                    out[slot] = Some(vector);
                }
            }
            Ok(vectors) => warn!(
                expected = missing.len(),
                got = vectors.len(),
                "Embedding batch size mismatch"
            ),
            Err(e) => warn!(error = %e, "Batch embedding failed"),
        }
        out
    }

    /// Cosine similarity. Zero vectors and length mismatches score 0.
    pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }
        let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }

    pub async fn text_similarity(&self, a: &str, b: &str) -> Option<f32> {
        let va = self.try_embed(a).await?;
        let vb = self.try_embed(b).await?;
        Some(Self::similarity(&va, &vb))
    }

    /// The most similar existing key at or above `threshold`.
    pub async fn find_similar_key(
        &self,
        candidate: &str,
        existing: &[String],
        threshold: f32,
    ) -> Option<String> {
        if existing.is_empty() {
            return None;
        }
        if let Some(exact) = existing.iter().find(|k| k.as_str() == candidate) {
            return Some(exact.clone());
        }
        let query = self.try_embed(candidate).await?;
        let vectors = self.embed_many(existing).await;

        let best = existing
            .iter()
            .zip(vectors)
            .filter_map(|(key, v)| v.map(|v| (key, Self::similarity(&query, &v))))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((key, score)) = &best {
            debug!(candidate, matched = %key, score, "Semantic key match");
        }
        best.map(|(key, _)| key.clone())
    }

    /// Greedy semantic deduplication preserving order.
    ///
    /// The first item seeds a cluster; each later item is dropped when it is at
    /// least `threshold` similar to any kept item. Items whose key could not be
    /// embedded are compared by exact key instead.
    pub async fn dedupe<T, F>(&self, items: Vec<T>, key_fn: F, threshold: f32) -> Vec<T>
    where
        F: Fn(&T) -> String,
    {
        if items.len() < 2 {
            return items;
        }
        let keys: Vec<String> = items.iter().map(&key_fn).collect();
        let vectors = self.embed_many(&keys).await;

        let mut kept: Vec<(usize, T)> = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let duplicate = kept.iter().any(|(j, _)| match (&vectors[i], &vectors[*j]) {
                (Some(a), Some(b)) => Self::similarity(a, b) >= threshold,
                _ => keys[i] == keys[*j],
            });
            if !duplicate {
                kept.push((i, item));
            }
        }
        kept.into_iter().map(|(_, item)| item).collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic embedder for tests: one dimension per keyword group.

    use super::{Embedder, EmbeddingError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    pub struct KeywordEmbedder {
        groups: Vec<Vec<&'static str>>,
        pub fail: AtomicBool,
        pub calls: AtomicUsize,
    }

    impl KeywordEmbedder {
        pub fn new(groups: Vec<Vec<&'static str>>) -> Self {
            Self {
                groups,
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn vector(&self, text: &str) -> Vec<f32> {
            let lower = text.to_lowercase();
            let words: Vec<&str> = lower
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .collect();
            let mut v: Vec<f32> = self
                .groups
                .iter()
                .map(|group| {
                    words.iter().filter(|w| group.contains(w)).count() as f32
                })
                .collect();
            // Small shared component keeps unrelated texts off the zero vector.
            v.push(0.05);
            v
        }
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmbeddingError::Backend("offline".into()));
            }
            Ok(texts.iter().map(|t| self.vector(t)).collect())
        }
    }
}
