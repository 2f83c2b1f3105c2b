// src/cascade/semantic.rs
//! Semantic stage: cosine similarity between the message embedding and the
//! subscription's cached keyword embedding. Anything that prevents a score
//! (missing cache, embedding-service failure, dimension drift) degrades to
//! `Unavailable` and the orchestrator falls through to verification.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::embedding::EmbeddingProvider;
use crate::normalize::anon_hash;
use crate::types::Subscription;

/// Outcome of the semantic stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SemanticScore {
    Score(f32),
    Unavailable,
}

#[derive(Clone)]
pub struct SemanticScorer {
    provider: Arc<dyn EmbeddingProvider>,
}

impl SemanticScorer {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    /// Embed a message once per evaluation; the vector is shared across all
    /// of the group's subscriptions. `None` means the stage is unavailable
    /// for this message (logged, never fatal).
    pub async fn embed_message(&self, text: &str) -> Option<Vec<f32>> {
        match self.provider.embed(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    target: "cascade",
                    text_hash = %anon_hash(text),
                    error = %e,
                    "embedding degraded, semantic stage unavailable"
                );
                None
            }
        }
    }

    /// Pure scoring against one subscription's cached embedding.
    pub fn score(message_embedding: Option<&[f32]>, subscription: &Subscription) -> SemanticScore {
        let Some(sub_vec) = subscription.keyword_embedding.as_deref() else {
            debug!(
                target: "cascade",
                subscription_id = subscription.id,
                "no cached keyword embedding, semantic stage skipped"
            );
            return SemanticScore::Unavailable;
        };
        let Some(msg_vec) = message_embedding else {
            return SemanticScore::Unavailable;
        };
        if msg_vec.len() != sub_vec.len() {
            warn!(
                target: "cascade",
                subscription_id = subscription.id,
                "embedding dimension drift, semantic stage skipped"
            );
            return SemanticScore::Unavailable;
        }
        SemanticScore::Score(cosine_similarity(msg_vec, sub_vec))
    }
}

/// Cosine similarity of two equal-length vectors, 0.0 when either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sub_with_embedding(embedding: Option<Vec<f32>>) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: 5,
            user_id: 2,
            group_id: -1,
            positive_keywords: vec!["велосипед".into()],
            negative_keywords: Vec::new(),
            disabled_negative_keywords: Vec::new(),
            keyword_embedding: embedding,
            active: true,
            paused: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, -0.2, 0.9];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn missing_cached_embedding_is_unavailable() {
        let sub = sub_with_embedding(None);
        assert_eq!(
            SemanticScorer::score(Some(&[1.0, 0.0]), &sub),
            SemanticScore::Unavailable
        );
    }

    #[test]
    fn missing_message_embedding_is_unavailable() {
        let sub = sub_with_embedding(Some(vec![1.0, 0.0]));
        assert_eq!(SemanticScorer::score(None, &sub), SemanticScore::Unavailable);
    }

    #[test]
    fn dimension_drift_is_unavailable() {
        let sub = sub_with_embedding(Some(vec![1.0, 0.0, 0.0]));
        assert_eq!(
            SemanticScorer::score(Some(&[1.0, 0.0]), &sub),
            SemanticScore::Unavailable
        );
    }

    #[test]
    fn aligned_vectors_score_high() {
        let sub = sub_with_embedding(Some(vec![0.6, 0.8]));
        match SemanticScorer::score(Some(&[0.6, 0.8]), &sub) {
            SemanticScore::Score(s) => assert!(s > 0.99),
            SemanticScore::Unavailable => panic!("expected a score"),
        }
    }
}
