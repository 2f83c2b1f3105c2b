// src/store/mod.rs
//! Store abstraction layer: the durable record of every evaluation plus the
//! subscription rows the cascade reads. Two backends: SQLite for real
//! deployments, in-memory for tests and dry runs. All writes for the same
//! analysis key must be safe under concurrent duplicate invocation; that is
//! the backend's job (keyed upsert), not the callers'.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{AnalysisKey, AnalysisRecord, Subscription};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Input for creating a subscription; the store assigns id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    pub user_id: i64,
    pub group_id: i64,
    pub positive_keywords: Vec<String>,
    #[serde(default)]
    pub negative_keywords: Vec<String>,
}

/// Durable analysis outcomes, keyed by (subscription, message, group).
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Idempotent upsert: a second save for the same key overwrites the
    /// evaluation fields and never duplicates. An already-set `notified_at`
    /// is preserved across overwrites.
    async fn save(&self, record: &AnalysisRecord) -> Result<(), EngineError>;

    async fn get(&self, key: AnalysisKey) -> Result<Option<AnalysisRecord>, EngineError>;

    async fn is_matched(&self, key: AnalysisKey) -> Result<bool, EngineError>;

    /// Cross-subscription per-user dedup: true if any of the user's
    /// subscriptions already has a matched, notified record for the message.
    async fn is_notified_to_user(
        &self,
        user_id: i64,
        message_id: i64,
        group_id: i64,
    ) -> Result<bool, EngineError>;

    /// Set `notified_at` once; first write wins. Returns whether this call
    /// performed the write.
    async fn mark_notified(
        &self,
        key: AnalysisKey,
        at: DateTime<Utc>,
    ) -> Result<bool, EngineError>;

    /// Users already notified (matched + notified_at set) for a message.
    async fn notified_users(
        &self,
        message_id: i64,
        group_id: i64,
    ) -> Result<Vec<i64>, EngineError>;

    /// All stored records for one message; inspection surface.
    async fn analysis_for_message(
        &self,
        group_id: i64,
        message_id: i64,
    ) -> Result<Vec<AnalysisRecord>, EngineError>;
}

/// Subscription rows: keyword sets, pause/deactivate lifecycle and the
/// lazily computed keyword embedding.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert_subscription(
        &self,
        new: NewSubscription,
    ) -> Result<Subscription, EngineError>;

    async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>, EngineError>;

    /// Active, non-paused subscriptions scoped to a group: the cascade's
    /// working set.
    async fn active_subscriptions_for_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<Subscription>, EngineError>;

    async fn set_paused(&self, id: i64, paused: bool) -> Result<(), EngineError>;

    /// Soft delete; subscriptions are deactivated, never destroyed.
    async fn deactivate(&self, id: i64) -> Result<(), EngineError>;

    /// Park or restore one negative keyword (moves it between the active and
    /// disabled sets).
    async fn set_negative_keyword_enabled(
        &self,
        id: i64,
        keyword: &str,
        enabled: bool,
    ) -> Result<(), EngineError>;

    async fn store_keyword_embedding(
        &self,
        id: i64,
        embedding: &[f32],
    ) -> Result<(), EngineError>;

    /// Active subscriptions still waiting for their keyword embedding.
    async fn subscriptions_missing_embedding(
        &self,
        limit: i64,
    ) -> Result<Vec<Subscription>, EngineError>;
}

/// Move `keyword` between the active and disabled negative sets, in memory.
/// Shared by both backends so the toggle semantics cannot drift.
pub(crate) fn toggle_negative_keyword(sub: &mut Subscription, keyword: &str, enabled: bool) {
    if enabled {
        if let Some(pos) = sub
            .disabled_negative_keywords
            .iter()
            .position(|k| k == keyword)
        {
            let kw = sub.disabled_negative_keywords.remove(pos);
            if !sub.negative_keywords.contains(&kw) {
                sub.negative_keywords.push(kw);
            }
        }
    } else if let Some(pos) = sub.negative_keywords.iter().position(|k| k == keyword) {
        let kw = sub.negative_keywords.remove(pos);
        if !sub.disabled_negative_keywords.contains(&kw) {
            sub.disabled_negative_keywords.push(kw);
        }
    }
}
