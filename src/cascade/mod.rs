// src/cascade/mod.rs
//! The matching cascade: lexical → semantic → verification, in strictly
//! increasing cost order, fanned out over a group's active subscriptions.
//! Every terminal state produces exactly one `AnalysisRecord`, persisted
//! before any notification is attempted. The whole path is safe to invoke
//! twice for the same message: the store upserts and the scheduler dedups.

pub mod lexical;
pub mod semantic;
pub mod verify;

use metrics::counter;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::config::{MatchingConfig, Thresholds};
use crate::embedding::EmbeddingProvider;
use crate::normalize::anon_hash;
use crate::scheduler::NotificationScheduler;
use crate::store::AnalysisStore;
use crate::types::{AnalysisOutcome, AnalysisRecord, IncomingMessage, Subscription};

pub use lexical::{LexicalOutcome, LexicalScorer};
pub use semantic::{cosine_similarity, SemanticScore, SemanticScorer};
pub use verify::{
    build_verifier_from_env, DisabledVerifier, MockVerifier, Verification, VerificationGate,
    VerifyContext, VerifyProvider,
};

#[derive(Clone)]
pub struct MatchOrchestrator {
    lexical: LexicalScorer,
    semantic: SemanticScorer,
    gate: VerificationGate,
    store: Arc<dyn AnalysisStore>,
    scheduler: Arc<NotificationScheduler>,
    thresholds: Thresholds,
}

impl MatchOrchestrator {
    pub fn new(
        cfg: &MatchingConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        verifier: Arc<dyn VerifyProvider>,
        store: Arc<dyn AnalysisStore>,
        scheduler: Arc<NotificationScheduler>,
    ) -> Self {
        Self {
            lexical: LexicalScorer::new(cfg.lexical),
            semantic: SemanticScorer::new(embedder),
            gate: VerificationGate::new(verifier, cfg.verification),
            store,
            scheduler,
            thresholds: cfg.thresholds,
        }
    }

    /// Evaluate one message against its group's subscriptions. Returns one
    /// record per evaluable subscription whose outcome was persisted;
    /// evaluations whose storage write failed are logged and omitted (no
    /// notification is ever sent on unpersisted state).
    pub async fn evaluate(
        &self,
        message: &IncomingMessage,
        subscriptions: Vec<Subscription>,
    ) -> Vec<AnalysisRecord> {
        let message = Arc::new(message.clone());
        let mut records = Vec::new();

        // Cheap stage inline; survivors go to the concurrent fan-out.
        let mut candidates = Vec::new();
        for sub in subscriptions.into_iter().filter(Subscription::is_evaluable) {
            let lex = self.lexical.score(&message.text, &sub);
            if let Some(keyword) = lex.matched_negative.as_ref() {
                let record = base_record(
                    &message,
                    &sub,
                    AnalysisOutcome::ExcludedNegativeKeyword,
                    Some(0.0),
                )
                .with_rejection_keyword(keyword.clone());
                if let Some(r) = self.persist(record).await {
                    records.push(r);
                }
            } else if lex.score < self.thresholds.lexical {
                let record = base_record(
                    &message,
                    &sub,
                    AnalysisOutcome::RejectedLexical,
                    Some(lex.score),
                );
                if let Some(r) = self.persist(record).await {
                    records.push(r);
                }
            } else {
                candidates.push((sub, lex));
            }
        }

        // One message embedding shared by every candidate that can use it.
        let need_embedding = candidates
            .iter()
            .any(|(sub, _)| sub.keyword_embedding.is_some());
        let message_embedding: Arc<Option<Vec<f32>>> = Arc::new(if need_embedding {
            self.semantic.embed_message(&message.text).await
        } else {
            None
        });

        // Expensive stages run concurrently; one subscription's failure (or
        // panic) never aborts its siblings.
        let mut tasks = JoinSet::new();
        for (sub, lex) in candidates {
            let this = self.clone();
            let message = Arc::clone(&message);
            let message_embedding = Arc::clone(&message_embedding);
            tasks.spawn(async move {
                this.evaluate_candidate(message, message_embedding, sub, lex)
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    error!(
                        target: "cascade",
                        text_hash = %anon_hash(&message.text),
                        error = %e,
                        "candidate evaluation aborted"
                    );
                }
            }
        }

        counter!("messages_evaluated_total").increment(1);
        records
    }

    /// Semantic and verification stages for one lexical survivor.
    async fn evaluate_candidate(
        &self,
        message: Arc<IncomingMessage>,
        message_embedding: Arc<Option<Vec<f32>>>,
        sub: Subscription,
        lex: LexicalOutcome,
    ) -> Option<AnalysisRecord> {
        let semantic = SemanticScorer::score((*message_embedding).as_deref(), &sub);
        let (semantic_score, proceed) = match semantic {
            // missing embedding or degraded service: fall through to
            // verification on the lexical evidence alone
            SemanticScore::Unavailable => (None, true),
            SemanticScore::Score(s) if s < self.thresholds.semantic => (Some(s), false),
            SemanticScore::Score(s) => (Some(s), true),
        };

        let mut record = base_record(
            &message,
            &sub,
            AnalysisOutcome::RejectedSemantic,
            Some(lex.score),
        );
        record.semantic_score = semantic_score;

        if proceed {
            let query = sub.query_text();
            let ctx = VerifyContext {
                query: &query,
                positive_keywords: &sub.positive_keywords,
                lexical_score: lex.score,
                semantic_score,
            };
            let verdict = self.gate.verify(&message.text, &ctx).await;
            record.verification_confidence = Some(verdict.confidence);
            record.verification_reasoning = Some(verdict.reasoning);
            record.outcome = if verdict.confidence >= self.thresholds.confidence {
                AnalysisOutcome::Matched
            } else {
                AnalysisOutcome::RejectedVerification
            };
        }

        let record = self.persist(record).await?;

        if record.is_matched() {
            let decision = self.scheduler.decide(&record, &message, &sub).await;
            debug!(
                target: "cascade",
                subscription_id = record.subscription_id,
                message_id = record.message_id,
                decision = ?decision,
                "match delivered to scheduler"
            );
        }
        Some(record)
    }

    /// Idempotent save; a storage failure is fatal for this one evaluation.
    async fn persist(&self, record: AnalysisRecord) -> Option<AnalysisRecord> {
        counter!("analysis_outcomes_total", "outcome" => record.outcome.to_string()).increment(1);
        match self.store.save(&record).await {
            Ok(()) => Some(record),
            Err(e) => {
                error!(
                    target: "cascade",
                    subscription_id = record.subscription_id,
                    message_id = record.message_id,
                    error = %e,
                    "failed to persist analysis result, suppressing notification"
                );
                None
            }
        }
    }
}

fn base_record(
    message: &IncomingMessage,
    sub: &Subscription,
    outcome: AnalysisOutcome,
    lexical_score: Option<f32>,
) -> AnalysisRecord {
    AnalysisRecord {
        subscription_id: sub.id,
        user_id: sub.user_id,
        group_id: message.group_id,
        message_id: message.message_id,
        outcome,
        lexical_score,
        semantic_score: None,
        verification_confidence: None,
        rejection_keyword: None,
        verification_reasoning: None,
        evaluated_at: chrono::Utc::now(),
        notified_at: None,
    }
}

impl AnalysisRecord {
    fn with_rejection_keyword(mut self, keyword: String) -> Self {
        self.rejection_keyword = Some(keyword);
        self
    }
}
