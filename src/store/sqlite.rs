// src/store/sqlite.rs
//! SQLite backend. Uses sqlx with WAL mode; the idempotency contract is
//! enforced by the storage engine itself via `INSERT .. ON CONFLICT DO
//! UPDATE` on the analysis primary key, so concurrent duplicate evaluations
//! need no application-level locking. Migrations run on startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteRow, SqliteSynchronous};
use sqlx::Row;

use crate::error::EngineError;
use crate::store::{toggle_negative_keyword, AnalysisStore, NewSubscription, SubscriptionStore};
use crate::types::{AnalysisKey, AnalysisOutcome, AnalysisRecord, Subscription};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run pending migrations.
    /// Accepts a bare path or a `sqlite://` URI.
    pub async fn connect(db_path: &str) -> Result<Self, EngineError> {
        let path = db_path.strip_prefix("sqlite://").unwrap_or(db_path);

        let opts = path
            .parse::<SqliteConnectOptions>()
            .map_err(|e| EngineError::Storage(format!("invalid db path '{db_path}': {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to open database: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| EngineError::Storage(format!("migration failed: {e}")))?;

        Ok(Self { pool })
    }
}

fn row_to_record(row: &SqliteRow) -> Result<AnalysisRecord, EngineError> {
    let outcome_str: String = row.try_get("outcome")?;
    let outcome: AnalysisOutcome = outcome_str
        .parse()
        .map_err(EngineError::Storage)?;
    Ok(AnalysisRecord {
        subscription_id: row.try_get("subscription_id")?,
        user_id: row.try_get("user_id")?,
        group_id: row.try_get("group_id")?,
        message_id: row.try_get("message_id")?,
        outcome,
        lexical_score: row.try_get("lexical_score")?,
        semantic_score: row.try_get("semantic_score")?,
        verification_confidence: row.try_get("verification_confidence")?,
        rejection_keyword: row.try_get("rejection_keyword")?,
        verification_reasoning: row.try_get("verification_reasoning")?,
        evaluated_at: row.try_get("evaluated_at")?,
        notified_at: row.try_get("notified_at")?,
    })
}

fn row_to_subscription(row: &SqliteRow) -> Result<Subscription, EngineError> {
    let positive: String = row.try_get("positive_keywords")?;
    let negative: String = row.try_get("negative_keywords")?;
    let disabled: String = row.try_get("disabled_negative_keywords")?;
    let embedding: Option<String> = row.try_get("keyword_embedding")?;

    Ok(Subscription {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        group_id: row.try_get("group_id")?,
        positive_keywords: serde_json::from_str(&positive)?,
        negative_keywords: serde_json::from_str(&negative)?,
        disabled_negative_keywords: serde_json::from_str(&disabled)?,
        keyword_embedding: embedding.as_deref().map(serde_json::from_str).transpose()?,
        active: row.try_get::<i64, _>("active")? != 0,
        paused: row.try_get::<i64, _>("paused")? != 0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl AnalysisStore for SqliteStore {
    async fn save(&self, record: &AnalysisRecord) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO message_analysis (
                subscription_id, user_id, group_id, message_id, outcome,
                lexical_score, semantic_score, verification_confidence,
                rejection_keyword, verification_reasoning, evaluated_at, notified_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (subscription_id, message_id, group_id) DO UPDATE SET
                user_id = excluded.user_id,
                outcome = excluded.outcome,
                lexical_score = excluded.lexical_score,
                semantic_score = excluded.semantic_score,
                verification_confidence = excluded.verification_confidence,
                rejection_keyword = excluded.rejection_keyword,
                verification_reasoning = excluded.verification_reasoning,
                evaluated_at = excluded.evaluated_at",
        )
        .bind(record.subscription_id)
        .bind(record.user_id)
        .bind(record.group_id)
        .bind(record.message_id)
        .bind(record.outcome.to_string())
        .bind(record.lexical_score)
        .bind(record.semantic_score)
        .bind(record.verification_confidence)
        .bind(record.rejection_keyword.as_deref())
        .bind(record.verification_reasoning.as_deref())
        .bind(record.evaluated_at)
        .bind(record.notified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: AnalysisKey) -> Result<Option<AnalysisRecord>, EngineError> {
        let row = sqlx::query(
            "SELECT * FROM message_analysis
             WHERE subscription_id = ? AND message_id = ? AND group_id = ?",
        )
        .bind(key.subscription_id)
        .bind(key.message_id)
        .bind(key.group_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn is_matched(&self, key: AnalysisKey) -> Result<bool, EngineError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM message_analysis
                WHERE subscription_id = ? AND message_id = ? AND group_id = ?
                  AND outcome = 'matched'
             )",
        )
        .bind(key.subscription_id)
        .bind(key.message_id)
        .bind(key.group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    async fn is_notified_to_user(
        &self,
        user_id: i64,
        message_id: i64,
        group_id: i64,
    ) -> Result<bool, EngineError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM message_analysis
                WHERE user_id = ? AND message_id = ? AND group_id = ?
                  AND outcome = 'matched' AND notified_at IS NOT NULL
             )",
        )
        .bind(user_id)
        .bind(message_id)
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    async fn mark_notified(
        &self,
        key: AnalysisKey,
        at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            "UPDATE message_analysis SET notified_at = ?
             WHERE subscription_id = ? AND message_id = ? AND group_id = ?
               AND notified_at IS NULL",
        )
        .bind(at)
        .bind(key.subscription_id)
        .bind(key.message_id)
        .bind(key.group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn notified_users(
        &self,
        message_id: i64,
        group_id: i64,
    ) -> Result<Vec<i64>, EngineError> {
        let rows = sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM message_analysis
             WHERE message_id = ? AND group_id = ?
               AND outcome = 'matched' AND notified_at IS NOT NULL",
        )
        .bind(message_id)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn analysis_for_message(
        &self,
        group_id: i64,
        message_id: i64,
    ) -> Result<Vec<AnalysisRecord>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM message_analysis
             WHERE group_id = ? AND message_id = ?
             ORDER BY subscription_id",
        )
        .bind(group_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn insert_subscription(
        &self,
        new: NewSubscription,
    ) -> Result<Subscription, EngineError> {
        let now = Utc::now();
        let positive = serde_json::to_string(&new.positive_keywords)?;
        let negative = serde_json::to_string(&new.negative_keywords)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO subscriptions (
                user_id, group_id, positive_keywords, negative_keywords,
                disabled_negative_keywords, active, paused, created_at, updated_at
             ) VALUES (?, ?, ?, ?, '[]', 1, 0, ?, ?)
             RETURNING id",
        )
        .bind(new.user_id)
        .bind(new.group_id)
        .bind(&positive)
        .bind(&negative)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(Subscription {
            id,
            user_id: new.user_id,
            group_id: new.group_id,
            positive_keywords: new.positive_keywords,
            negative_keywords: new.negative_keywords,
            disabled_negative_keywords: Vec::new(),
            keyword_embedding: None,
            active: true,
            paused: false,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>, EngineError> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    async fn active_subscriptions_for_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<Subscription>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM subscriptions
             WHERE group_id = ? AND active = 1 AND paused = 0
             ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn set_paused(&self, id: i64, paused: bool) -> Result<(), EngineError> {
        let result = sqlx::query("UPDATE subscriptions SET paused = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(paused))
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::SubscriptionNotFound(id));
        }
        Ok(())
    }

    async fn deactivate(&self, id: i64) -> Result<(), EngineError> {
        let result = sqlx::query("UPDATE subscriptions SET active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::SubscriptionNotFound(id));
        }
        Ok(())
    }

    async fn set_negative_keyword_enabled(
        &self,
        id: i64,
        keyword: &str,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let mut sub = self
            .get_subscription(id)
            .await?
            .ok_or(EngineError::SubscriptionNotFound(id))?;
        toggle_negative_keyword(&mut sub, keyword, enabled);
        sqlx::query(
            "UPDATE subscriptions
             SET negative_keywords = ?, disabled_negative_keywords = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(serde_json::to_string(&sub.negative_keywords)?)
        .bind(serde_json::to_string(&sub.disabled_negative_keywords)?)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_keyword_embedding(
        &self,
        id: i64,
        embedding: &[f32],
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET keyword_embedding = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(embedding)?)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::SubscriptionNotFound(id));
        }
        Ok(())
    }

    async fn subscriptions_missing_embedding(
        &self,
        limit: i64,
    ) -> Result<Vec<Subscription>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM subscriptions
             WHERE active = 1 AND keyword_embedding IS NULL
             ORDER BY id
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_subscription).collect()
    }
}
