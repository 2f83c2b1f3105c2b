// src/types.rs
//! Core data model shared by the cascade, the store and the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Media attached to an incoming message. Tagged by kind; the cascade never
/// inspects media, it only forwards references to the delivery layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaRef {
    Photo {
        file_id: String,
    },
    Video {
        file_id: String,
    },
    Document {
        file_id: String,
        #[serde(default)]
        file_name: Option<String>,
    },
}

/// One message as produced by the transport layer. Immutable once received;
/// the cascade never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub group_id: i64,
    pub message_id: i64,
    pub text: String,
    pub sender_id: i64,
    pub sender_name: String,
    #[serde(default)]
    pub sender_username: Option<String>,
    #[serde(default)]
    pub group_title: Option<String>,
    #[serde(default)]
    pub group_username: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
}

impl IncomingMessage {
    /// Short excerpt for notification payloads (char-boundary safe).
    pub fn excerpt(&self, max_chars: usize) -> String {
        if self.text.chars().count() <= max_chars {
            return self.text.clone();
        }
        let cut: String = self.text.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

/// Plan tier of a subscription owner. Read-only from the engine's
/// perspective; only the priority-delivery bit matters here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Basic,
    Pro,
    Business,
}

impl PlanTier {
    /// Pro and Business ship notifications instantly; Free and Basic are
    /// subject to the competitive delay.
    pub fn has_priority_delivery(self) -> bool {
        matches!(self, PlanTier::Pro | PlanTier::Business)
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanTier::Free => write!(f, "free"),
            PlanTier::Basic => write!(f, "basic"),
            PlanTier::Pro => write!(f, "pro"),
            PlanTier::Business => write!(f, "business"),
        }
    }
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanTier::Free),
            "basic" => Ok(PlanTier::Basic),
            "pro" => Ok(PlanTier::Pro),
            "business" => Ok(PlanTier::Business),
            other => Err(format!("unknown plan tier: {other}")),
        }
    }
}

/// A user's standing filter over a group's message stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub group_id: i64,
    /// Non-empty for any evaluable subscription.
    pub positive_keywords: Vec<String>,
    pub negative_keywords: Vec<String>,
    /// Negative keywords the user toggled off; parked, not deleted.
    #[serde(default)]
    pub disabled_negative_keywords: Vec<String>,
    /// Computed lazily by the embedding backfill job.
    #[serde(default)]
    pub keyword_embedding: Option<Vec<f32>>,
    pub active: bool,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// The user's original query, reconstructed for notification payloads
    /// and for embedding.
    pub fn query_text(&self) -> String {
        self.positive_keywords.join(", ")
    }

    /// Paused or deactivated subscriptions are excluded from the cascade.
    pub fn is_evaluable(&self) -> bool {
        self.active && !self.paused && !self.positive_keywords.is_empty()
    }
}

/// Terminal state of one (subscription, message) evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Matched,
    ExcludedNegativeKeyword,
    RejectedLexical,
    RejectedSemantic,
    RejectedVerification,
}

impl fmt::Display for AnalysisOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnalysisOutcome::Matched => "matched",
            AnalysisOutcome::ExcludedNegativeKeyword => "excluded_negative_keyword",
            AnalysisOutcome::RejectedLexical => "rejected_lexical",
            AnalysisOutcome::RejectedSemantic => "rejected_semantic",
            AnalysisOutcome::RejectedVerification => "rejected_verification",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AnalysisOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "matched" => Ok(AnalysisOutcome::Matched),
            "excluded_negative_keyword" => Ok(AnalysisOutcome::ExcludedNegativeKeyword),
            "rejected_lexical" => Ok(AnalysisOutcome::RejectedLexical),
            "rejected_semantic" => Ok(AnalysisOutcome::RejectedSemantic),
            "rejected_verification" => Ok(AnalysisOutcome::RejectedVerification),
            other => Err(format!("unknown analysis outcome: {other}")),
        }
    }
}

/// Identity of one evaluation. Exactly one `AnalysisRecord` may exist per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnalysisKey {
    pub subscription_id: i64,
    pub message_id: i64,
    pub group_id: i64,
}

/// Durable outcome of evaluating one (subscription, message) pair.
/// Created by the orchestrator; `notified_at` is set exactly once by the
/// scheduler when delivery actually happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub subscription_id: i64,
    pub user_id: i64,
    pub group_id: i64,
    pub message_id: i64,
    pub outcome: AnalysisOutcome,
    pub lexical_score: Option<f32>,
    pub semantic_score: Option<f32>,
    pub verification_confidence: Option<f32>,
    pub rejection_keyword: Option<String>,
    pub verification_reasoning: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
}

impl AnalysisRecord {
    pub fn key(&self) -> AnalysisKey {
        AnalysisKey {
            subscription_id: self.subscription_id,
            message_id: self.message_id,
            group_id: self.group_id,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.outcome == AnalysisOutcome::Matched
    }
}

/// Structured handoff to the delivery collaborator. The engine never talks
/// to the transport directly except through this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipient_id: i64,
    pub subscription_id: i64,
    pub group_id: i64,
    pub message_id: i64,
    pub group_title: Option<String>,
    pub group_username: Option<String>,
    pub sender_name: String,
    pub sender_username: Option<String>,
    /// Message text excerpt shown to the user.
    pub excerpt: String,
    /// The subscription's original query.
    pub query: String,
    /// Human-readable reasoning; carries the delay-disclosure suffix when
    /// `was_delayed` is set.
    pub reasoning: String,
    pub media: Vec<MediaRef>,
    pub was_delayed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_tier_priority_bit() {
        assert!(!PlanTier::Free.has_priority_delivery());
        assert!(!PlanTier::Basic.has_priority_delivery());
        assert!(PlanTier::Pro.has_priority_delivery());
        assert!(PlanTier::Business.has_priority_delivery());
    }

    #[test]
    fn outcome_round_trips_as_text() {
        for o in [
            AnalysisOutcome::Matched,
            AnalysisOutcome::ExcludedNegativeKeyword,
            AnalysisOutcome::RejectedLexical,
            AnalysisOutcome::RejectedSemantic,
            AnalysisOutcome::RejectedVerification,
        ] {
            assert_eq!(o.to_string().parse::<AnalysisOutcome>(), Ok(o));
        }
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let msg = IncomingMessage {
            group_id: -1,
            message_id: 1,
            text: "Продам велосипед почти новый".to_string(),
            sender_id: 7,
            sender_name: "seller".to_string(),
            sender_username: None,
            group_title: None,
            group_username: None,
            timestamp: Utc::now(),
            media: Vec::new(),
        };
        let cut = msg.excerpt(6);
        assert_eq!(cut, "Продам…");
    }

    #[test]
    fn paused_subscription_is_not_evaluable() {
        let now = Utc::now();
        let sub = Subscription {
            id: 1,
            user_id: 1,
            group_id: -1,
            positive_keywords: vec!["bike".into()],
            negative_keywords: vec![],
            disabled_negative_keywords: vec![],
            keyword_embedding: None,
            active: true,
            paused: true,
            created_at: now,
            updated_at: now,
        };
        assert!(!sub.is_evaluable());
    }
}
