//! Decides whether a generative call should be augmented with live web search.

use std::sync::Arc;

use serde::Serialize;

use crate::config::GroundingConfig;
use crate::semantic::{SemanticIndex, Vector};

/// Why a grounding decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundingReason {
    BrandQuery,
    Freshness,
    SpecificModel,
    TopicDrift,
    CategoryAffinity,
    EmbeddingUnavailable,
}

impl GroundingReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BrandQuery => "brand_query",
            Self::Freshness => "freshness",
            Self::SpecificModel => "specific_model",
            Self::TopicDrift => "topic_drift",
            Self::CategoryAffinity => "category_affinity",
            Self::EmbeddingUnavailable => "embedding_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GroundingDecision {
    pub ground: bool,
    pub confidence: f32,
    pub reason: GroundingReason,
}

/// Raw (unweighted) signal values, exposed for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroundingSignals {
    pub freshness: f32,
    pub specific_model: f32,
    pub topic_drift: f32,
    pub category_affinity: f32,
}

#[derive(Debug)]
pub struct GroundingDecisionEngine {
    index: Arc<SemanticIndex>,
    config: GroundingConfig,
}

impl GroundingDecisionEngine {
    pub fn new(index: Arc<SemanticIndex>, config: GroundingConfig) -> Self {
        Self { index, config }
    }

    /// Score `user_text` against the recent user turns and session category.
    pub async fn decide(
        &self,
        user_text: &str,
        recent_user_turns: &[String],
        category: Option<&str>,
    ) -> GroundingDecision {
        let Some(query) = self.index.try_embed(user_text).await else {
            return GroundingDecision {
                ground: false,
                confidence: 0.0,
                reason: GroundingReason::EmbeddingUnavailable,
            };
        };

        if let Some(decision) = self.brand_short_circuit(user_text, &query).await {
            return decision;
        }

        let signals = self.signals(&query, recent_user_turns, category).await;
        let decision = self.combine(signals);
        tracing::debug!(
            ground = decision.ground,
            confidence = decision.confidence,
            reason = decision.reason.as_str(),
            freshness = signals.freshness,
            specific_model = signals.specific_model,
            topic_drift = signals.topic_drift,
            category_affinity = signals.category_affinity,
            "Grounding decision"
        );
        decision
    }

    async fn concept_similarity(&self, query: &Vector, concept: &str) -> f32 {
        match self.index.try_embed(concept).await {
            Some(v) => SemanticIndex::similarity(query, &v),
            None => 0.0,
        }
    }

    async fn brand_short_circuit(
        &self,
        user_text: &str,
        query: &Vector,
    ) -> Option<GroundingDecision> {
        let words = user_text.split_whitespace().count();
        if words == 0 || words > self.config.brand_max_words {
            return None;
        }
        let concepts = &self.config.concepts;
        let brand = self.concept_similarity(query, &concepts.brand).await;
        let generic = self.concept_similarity(query, &concepts.generic_product).await;
        (brand >= self.config.brand_similarity_threshold && brand > generic).then_some(
            GroundingDecision {
                ground: true,
                confidence: self.config.brand_query_confidence,
                reason: GroundingReason::BrandQuery,
            },
        )
    }

    async fn signals(
        &self,
        query: &Vector,
        recent_user_turns: &[String],
        category: Option<&str>,
    ) -> GroundingSignals {
        let concepts = &self.config.concepts;
        let freshness = self.concept_similarity(query, &concepts.freshness).await.max(0.0);
        let specific_model = self
            .concept_similarity(query, &concepts.specific_model)
            .await
            .max(0.0);

        let topic_drift = self.topic_drift(query, recent_user_turns).await;
        let category_affinity = self.category_affinity(query, category).await;

        GroundingSignals {
            freshness,
            specific_model,
            topic_drift,
            category_affinity,
        }
    }

    async fn topic_drift(&self, query: &Vector, recent_user_turns: &[String]) -> f32 {
        let window_start = recent_user_turns
            .len()
            .saturating_sub(self.config.drift_window);
        let window = &recent_user_turns[window_start..];
        if window.is_empty() {
            return 0.0;
        }

        let vectors: Vec<Vector> = self
            .index
            .embed_many(window)
            .await
            .into_iter()
            .flatten()
            .filter(|v| v.len() == query.len())
            .collect();
        if vectors.is_empty() {
            return 0.0;
        }

        let mut mean = vec![0.0f32; query.len()];
        for v in &vectors {
            for (acc, x) in mean.iter_mut().zip(v.iter()) {
                *acc += x;
            }
        }
        let n = vectors.len() as f32;
        mean.iter_mut().for_each(|x| *x /= n);

        let drift = 1.0 - SemanticIndex::similarity(query, &mean);
        if drift > self.config.drift_threshold {
            drift.min(1.0)
        } else {
            0.0
        }
    }

    async fn category_affinity(&self, query: &Vector, category: Option<&str>) -> f32 {
        let Some(category) = category.filter(|c| !c.trim().is_empty()) else {
            return 0.0;
        };
        if category.eq_ignore_ascii_case("electronics") {
            let sim = self
                .concept_similarity(query, &self.config.concepts.electronics)
                .await;
            if sim > self.config.electronics_threshold {
                return self.config.electronics_score;
            }
            return 0.0;
        }
        let concept = format!("{} {}", self.config.concepts.category, category);
        let sim = self.concept_similarity(query, &concept).await;
        if sim > self.config.category_threshold {
            self.config.category_score
        } else {
            0.0
        }
    }

    /// Weighted sum, thresholded. The reason is the largest contribution;
    /// ties go to the earlier signal.
    pub fn combine(&self, signals: GroundingSignals) -> GroundingDecision {
        let w = self.config.weights;
        let contributions = [
            (GroundingReason::Freshness, w.freshness * signals.freshness),
            (
                GroundingReason::SpecificModel,
                w.specific_model * signals.specific_model,
            ),
            (GroundingReason::TopicDrift, w.topic_drift * signals.topic_drift),
            (
                GroundingReason::CategoryAffinity,
                w.category * signals.category_affinity,
            ),
        ];

        let total: f32 = contributions.iter().map(|(_, c)| c).sum();
        let mut reason = contributions[0];
        for candidate in &contributions[1..] {
            if candidate.1 > reason.1 {
                reason = *candidate;
            }
        }

        GroundingDecision {
            ground: total > self.config.decision_threshold,
            confidence: total.clamp(0.0, 1.0),
            reason: reason.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroundingConcepts;
    use crate::semantic::testing::KeywordEmbedder;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn groups() -> Vec<Vec<&'static str>> {
        vec![
            vec!["samsung", "apple", "sony", "brand", "manufacturer"],
            vec!["phone", "laptop", "shoes", "product", "generic"],
            vec!["latest", "newest", "new", "released"],
            vec!["pro", "ultra", "model", "s24", "version"],
            vec!["electronics", "gadget", "tv", "camera", "phone", "laptop"],
            vec!["garden", "hose", "plants", "shovel"],
            vec!["store", "shopping", "kitchen", "blender", "toaster"],
        ]
    }

    fn config() -> GroundingConfig {
        GroundingConfig {
            concepts: GroundingConcepts {
                brand: "brand manufacturer samsung apple sony".into(),
                generic_product: "generic product phone laptop shoes".into(),
                freshness: "latest newest new released".into(),
                specific_model: "model version pro ultra s24".into(),
                electronics: "electronics gadget tv camera".into(),
                category: "store shopping".into(),
            },
            decision_threshold: 0.3,
            ..GroundingConfig::default()
        }
    }

    fn engine(cfg: GroundingConfig) -> (GroundingDecisionEngine, Arc<KeywordEmbedder>) {
        let embedder = Arc::new(KeywordEmbedder::new(groups()));
        let index = Arc::new(SemanticIndex::new(
            Arc::clone(&embedder) as _,
            Duration::from_secs(60),
            1000,
        ));
        (GroundingDecisionEngine::new(index, cfg), embedder)
    }

    #[tokio::test]
    async fn test_brand_only_query_short_circuits() {
        let cfg = config();
        let expected = cfg.brand_query_confidence;
        let (engine, _) = engine(cfg);
        let decision = engine.decide("Samsung", &[], None).await;
        assert!(decision.ground);
        assert_eq!(decision.reason, GroundingReason::BrandQuery);
        assert_eq!(decision.confidence, expected);
    }

    #[tokio::test]
    async fn test_generic_short_query_is_not_a_brand_query() {
        let (engine, _) = engine(config());
        let decision = engine.decide("phone", &[], None).await;
        assert_ne!(decision.reason, GroundingReason::BrandQuery);
    }

    #[tokio::test]
    async fn test_long_query_skips_brand_short_circuit() {
        let cfg = GroundingConfig {
            brand_max_words: 1,
            ..config()
        };
        let (engine, _) = engine(cfg);
        let decision = engine.decide("samsung apple sony", &[], None).await;
        assert_ne!(decision.reason, GroundingReason::BrandQuery);
    }

    #[tokio::test]
    async fn test_freshness_language_grounds() {
        let (engine, _) = engine(config());
        let decision = engine
            .decide("show me the latest newest released things", &[], None)
            .await;
        assert!(decision.ground);
        assert_eq!(decision.reason, GroundingReason::Freshness);
    }

    #[tokio::test]
    async fn test_plain_chatter_does_not_ground() {
        let (engine, _) = engine(config());
        let decision = engine
            .decide("thanks that is helpful for my garden", &[], None)
            .await;
        assert!(!decision.ground);
    }

    #[tokio::test]
    async fn test_topic_drift_counts_only_above_threshold() {
        let (engine, _) = engine(config());
        let history = vec!["garden hose".to_string(), "plants shovel".to_string()];
        let query = engine.index.embed("kitchen blender toaster").await.unwrap();
        let drift = engine.topic_drift(&query, &history).await;
        assert!(drift > 0.9);

        let similar = engine.index.embed("garden plants").await.unwrap();
        assert_eq!(engine.topic_drift(&similar, &history).await, 0.0);
    }

    #[tokio::test]
    async fn test_electronics_affinity_uses_fixed_score() {
        let cfg = config();
        let score = cfg.electronics_score;
        let (engine, _) = engine(cfg);
        let query = engine.index.embed("tv camera gadget").await.unwrap();
        assert_eq!(
            engine.category_affinity(&query, Some("electronics")).await,
            score
        );
        assert_eq!(engine.category_affinity(&query, None).await, 0.0);
    }

    #[test]
    fn test_combine_reason_tie_breaks_by_order() {
        let (engine, _) = engine(GroundingConfig {
            weights: crate::config::GroundingWeights {
                freshness: 0.5,
                specific_model: 0.5,
                topic_drift: 0.0,
                category: 0.0,
            },
            decision_threshold: 0.5,
            ..config()
        });
        let decision = engine.combine(GroundingSignals {
            freshness: 0.6,
            specific_model: 0.6,
            topic_drift: 0.0,
            category_affinity: 0.0,
        });
        assert_eq!(decision.reason, GroundingReason::Freshness);
        assert!(decision.ground);
        assert!((decision.confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_combine_threshold_is_strict() {
        let (engine, _) = engine(GroundingConfig {
            decision_threshold: 0.35,
            ..config()
        });
        // freshness weight 0.35 * 1.0 == threshold, not above it
        let decision = engine.combine(GroundingSignals {
            freshness: 1.0,
            ..GroundingSignals::default()
        });
        assert!(!decision.ground);
    }

    #[tokio::test]
    async fn test_embedding_failure_never_grounds() {
        let (engine, embedder) = engine(config());
        embedder.fail.store(true, Ordering::SeqCst);
        let decision = engine.decide("latest samsung", &[], None).await;
        assert!(!decision.ground);
        assert_eq!(decision.reason, GroundingReason::EmbeddingUnavailable);
    }
}
