// src/store/memory.rs
//! In-memory backend: mutex-guarded maps with the same upsert semantics as
//! the SQLite backend. Used by tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::error::EngineError;
use crate::store::{toggle_negative_keyword, AnalysisStore, NewSubscription, SubscriptionStore};
use crate::types::{AnalysisKey, AnalysisRecord, AnalysisOutcome, Subscription};

pub struct MemoryStore {
    analysis: Mutex<HashMap<AnalysisKey, AnalysisRecord>>,
    subscriptions: Mutex<HashMap<i64, Subscription>>,
    next_subscription_id: AtomicI64,
    fail_saves: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            analysis: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicI64::new(1),
            fail_saves: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make subsequent `save` calls fail; exercises the write-failure path.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Seed a fully formed subscription (tests control ids and embeddings).
    pub fn put_subscription(&self, sub: Subscription) {
        let mut guard = self.subscriptions.lock().expect("subscriptions poisoned");
        let next = self.next_subscription_id.load(Ordering::SeqCst);
        if sub.id >= next {
            self.next_subscription_id.store(sub.id + 1, Ordering::SeqCst);
        }
        guard.insert(sub.id, sub);
    }

    pub fn analysis_count(&self) -> usize {
        self.analysis.lock().expect("analysis poisoned").len()
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn save(&self, record: &AnalysisRecord) -> Result<(), EngineError> {
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(EngineError::Storage("simulated write failure".into()));
        }
        let mut guard = self.analysis.lock().expect("analysis poisoned");
        let key = record.key();
        match guard.get_mut(&key) {
            Some(existing) => {
                // overwrite the evaluation, preserve an already-set notified_at
                let notified_at = existing.notified_at.or(record.notified_at);
                *existing = record.clone();
                existing.notified_at = notified_at;
            }
            None => {
                guard.insert(key, record.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, key: AnalysisKey) -> Result<Option<AnalysisRecord>, EngineError> {
        Ok(self
            .analysis
            .lock()
            .expect("analysis poisoned")
            .get(&key)
            .cloned())
    }

    async fn is_matched(&self, key: AnalysisKey) -> Result<bool, EngineError> {
        Ok(self
            .analysis
            .lock()
            .expect("analysis poisoned")
            .get(&key)
            .map(|r| r.outcome == AnalysisOutcome::Matched)
            .unwrap_or(false))
    }

    async fn is_notified_to_user(
        &self,
        user_id: i64,
        message_id: i64,
        group_id: i64,
    ) -> Result<bool, EngineError> {
        Ok(self
            .analysis
            .lock()
            .expect("analysis poisoned")
            .values()
            .any(|r| {
                r.user_id == user_id
                    && r.message_id == message_id
                    && r.group_id == group_id
                    && r.outcome == AnalysisOutcome::Matched
                    && r.notified_at.is_some()
            }))
    }

    async fn mark_notified(
        &self,
        key: AnalysisKey,
        at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let mut guard = self.analysis.lock().expect("analysis poisoned");
        match guard.get_mut(&key) {
            Some(record) if record.notified_at.is_none() => {
                record.notified_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::Storage(format!(
                "mark_notified for unknown key {key:?}"
            ))),
        }
    }

    async fn notified_users(
        &self,
        message_id: i64,
        group_id: i64,
    ) -> Result<Vec<i64>, EngineError> {
        let guard = self.analysis.lock().expect("analysis poisoned");
        let mut users: Vec<i64> = guard
            .values()
            .filter(|r| {
                r.message_id == message_id
                    && r.group_id == group_id
                    && r.outcome == AnalysisOutcome::Matched
                    && r.notified_at.is_some()
            })
            .map(|r| r.user_id)
            .collect();
        users.sort_unstable();
        users.dedup();
        Ok(users)
    }

    async fn analysis_for_message(
        &self,
        group_id: i64,
        message_id: i64,
    ) -> Result<Vec<AnalysisRecord>, EngineError> {
        let guard = self.analysis.lock().expect("analysis poisoned");
        let mut records: Vec<AnalysisRecord> = guard
            .values()
            .filter(|r| r.group_id == group_id && r.message_id == message_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.subscription_id);
        Ok(records)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn insert_subscription(
        &self,
        new: NewSubscription,
    ) -> Result<Subscription, EngineError> {
        let now = Utc::now();
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let sub = Subscription {
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
        };
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .insert(id, sub.clone());
        Ok(sub)
    }

    async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>, EngineError> {
        Ok(self
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .get(&id)
            .cloned())
    }

    async fn active_subscriptions_for_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<Subscription>, EngineError> {
        let guard = self.subscriptions.lock().expect("subscriptions poisoned");
        let mut subs: Vec<Subscription> = guard
            .values()
            .filter(|s| s.group_id == group_id && s.active && !s.paused)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    async fn set_paused(&self, id: i64, paused: bool) -> Result<(), EngineError> {
        let mut guard = self.subscriptions.lock().expect("subscriptions poisoned");
        let sub = guard
            .get_mut(&id)
            .ok_or(EngineError::SubscriptionNotFound(id))?;
        sub.paused = paused;
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn deactivate(&self, id: i64) -> Result<(), EngineError> {
        let mut guard = self.subscriptions.lock().expect("subscriptions poisoned");
        let sub = guard
            .get_mut(&id)
            .ok_or(EngineError::SubscriptionNotFound(id))?;
        sub.active = false;
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn set_negative_keyword_enabled(
        &self,
        id: i64,
        keyword: &str,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let mut guard = self.subscriptions.lock().expect("subscriptions poisoned");
        let sub = guard
            .get_mut(&id)
            .ok_or(EngineError::SubscriptionNotFound(id))?;
        toggle_negative_keyword(sub, keyword, enabled);
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn store_keyword_embedding(
        &self,
        id: i64,
        embedding: &[f32],
    ) -> Result<(), EngineError> {
        let mut guard = self.subscriptions.lock().expect("subscriptions poisoned");
        let sub = guard
            .get_mut(&id)
            .ok_or(EngineError::SubscriptionNotFound(id))?;
        sub.keyword_embedding = Some(embedding.to_vec());
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn subscriptions_missing_embedding(
        &self,
        limit: i64,
    ) -> Result<Vec<Subscription>, EngineError> {
        let guard = self.subscriptions.lock().expect("subscriptions poisoned");
        let mut subs: Vec<Subscription> = guard
            .values()
            .filter(|s| s.active && s.keyword_embedding.is_none())
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        subs.truncate(limit.max(0) as usize);
        Ok(subs)
    }
}
