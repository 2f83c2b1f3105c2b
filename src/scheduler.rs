// src/scheduler.rs
//! Notification scheduler: decides instant vs. delayed delivery per
//! (user, message) and flushes the in-memory delay queue on a fixed tick.
//!
//! The competition check is a point-in-time snapshot taken at decision
//! instant; a priority match landing a moment later does not retroactively
//! delay anything already sent. The queue is not persisted: entries do not
//! survive a process restart.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SchedulerParams;
use crate::error::EngineError;
use crate::notify::NotificationSink;
use crate::store::AnalysisStore;
use crate::types::{
    AnalysisKey, AnalysisRecord, IncomingMessage, NotificationRequest, PlanTier, Subscription,
};

const EXCERPT_CHARS: usize = 200;

/// Where to look up a user's plan tier. Read-only; plans live outside the
/// engine.
#[async_trait]
pub trait PlanResolver: Send + Sync {
    async fn plan_tier(&self, user_id: i64) -> PlanTier;
}

/// Fixed user → tier map with a default; enough for deployments where the
/// billing system exports the priority set, and for tests.
pub struct StaticPlanResolver {
    tiers: HashMap<i64, PlanTier>,
    default: PlanTier,
}

impl StaticPlanResolver {
    pub fn new(default: PlanTier) -> Self {
        Self {
            tiers: HashMap::new(),
            default,
        }
    }

    pub fn with_tier(mut self, user_id: i64, tier: PlanTier) -> Self {
        self.tiers.insert(user_id, tier);
        self
    }

    /// `PRIORITY_USER_IDS` is a comma-separated list of user ids granted
    /// priority delivery; everyone else defaults to the free tier.
    pub fn from_env() -> Self {
        let mut resolver = Self::new(PlanTier::Free);
        if let Ok(raw) = std::env::var("PRIORITY_USER_IDS") {
            for part in raw.split(',') {
                if let Ok(id) = part.trim().parse::<i64>() {
                    resolver.tiers.insert(id, PlanTier::Pro);
                }
            }
        }
        resolver
    }
}

#[async_trait]
impl PlanResolver for StaticPlanResolver {
    async fn plan_tier(&self, user_id: i64) -> PlanTier {
        self.tiers.get(&user_id).copied().unwrap_or(self.default)
    }
}

/// One parked notification. In-memory only.
#[derive(Debug, Clone)]
pub struct DelayedNotificationEntry {
    pub user_id: i64,
    pub key: AnalysisKey,
    pub request: NotificationRequest,
    pub scheduled_at: DateTime<Utc>,
    pub was_delayed: bool,
}

/// What `decide` did, for callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDecision {
    DeliveredInstant,
    Delayed(DateTime<Utc>),
    /// Another subscription of the same user already covered this message.
    AlreadyNotified,
    /// Delivery or bookkeeping failed; logged, nothing retried.
    Failed,
}

pub struct NotificationScheduler {
    store: Arc<dyn AnalysisStore>,
    plans: Arc<dyn PlanResolver>,
    sink: Arc<dyn NotificationSink>,
    params: SchedulerParams,
    queue: Mutex<Vec<DelayedNotificationEntry>>,
    /// Serializes the check-then-deliver window so two concurrent matches
    /// for the same user cannot both pass the dedup check.
    decide_gate: tokio::sync::Mutex<()>,
}

impl NotificationScheduler {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        plans: Arc<dyn PlanResolver>,
        sink: Arc<dyn NotificationSink>,
        params: SchedulerParams,
    ) -> Self {
        Self {
            store,
            plans,
            sink,
            params,
            queue: Mutex::new(Vec::new()),
            decide_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().expect("delay queue poisoned").len()
    }

    /// Decide delivery for a fresh matched record, evaluated once at match
    /// time with `now` as the decision instant.
    pub async fn decide_at(
        &self,
        now: DateTime<Utc>,
        record: &AnalysisRecord,
        message: &IncomingMessage,
        subscription: &Subscription,
    ) -> DeliveryDecision {
        debug_assert!(record.is_matched());
        let _gate = self.decide_gate.lock().await;

        // 1) Another subscription of this user may already have covered the
        //    message.
        match self
            .store
            .is_notified_to_user(record.user_id, record.message_id, record.group_id)
            .await
        {
            Ok(true) => {
                counter!("notifications_suppressed_total").increment(1);
                debug!(
                    target: "scheduler",
                    user_id = record.user_id,
                    message_id = record.message_id,
                    "user already notified for this message"
                );
                return DeliveryDecision::AlreadyNotified;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(target: "scheduler", error = %e, "dedup check failed, not notifying");
                return DeliveryDecision::Failed;
            }
        }

        let request = build_request(record, message, subscription, false);

        // 2) Priority plans always ship instantly.
        let tier = self.plans.plan_tier(record.user_id).await;
        if tier.has_priority_delivery() {
            return self.dispatch_now(record.key(), &request).await;
        }

        // 3) Snapshot: has any priority user already been notified for this
        //    message?
        match self.priority_competitor_exists(record).await {
            Ok(true) => {
                let scheduled_at =
                    now + ChronoDuration::seconds(self.params.priority_delay_secs as i64);
                let entry = DelayedNotificationEntry {
                    user_id: record.user_id,
                    key: record.key(),
                    request,
                    scheduled_at,
                    was_delayed: true,
                };
                let depth = {
                    let mut queue = self.queue.lock().expect("delay queue poisoned");
                    queue.push(entry);
                    queue.len()
                };
                counter!("notifications_delayed_total").increment(1);
                gauge!("delay_queue_depth").set(depth as f64);
                info!(
                    target: "scheduler",
                    user_id = record.user_id,
                    message_id = record.message_id,
                    scheduled_at = %scheduled_at,
                    "notification delayed behind priority delivery"
                );
                DeliveryDecision::Delayed(scheduled_at)
            }
            Ok(false) => self.dispatch_now(record.key(), &request).await,
            Err(e) => {
                warn!(target: "scheduler", error = %e, "competition check failed, not notifying");
                DeliveryDecision::Failed
            }
        }
    }

    /// `decide_at` with the wall clock.
    pub async fn decide(
        &self,
        record: &AnalysisRecord,
        message: &IncomingMessage,
        subscription: &Subscription,
    ) -> DeliveryDecision {
        self.decide_at(Utc::now(), record, message, subscription).await
    }

    async fn priority_competitor_exists(
        &self,
        record: &AnalysisRecord,
    ) -> Result<bool, EngineError> {
        let users = self
            .store
            .notified_users(record.message_id, record.group_id)
            .await?;
        for user_id in users {
            if self.plans.plan_tier(user_id).await.has_priority_delivery() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn dispatch_now(
        &self,
        key: AnalysisKey,
        request: &NotificationRequest,
    ) -> DeliveryDecision {
        match self.sink.deliver(request).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_notified(key, Utc::now()).await {
                    warn!(target: "scheduler", error = %e, "mark_notified failed after delivery");
                    return DeliveryDecision::Failed;
                }
                counter!("notifications_instant_total").increment(1);
                DeliveryDecision::DeliveredInstant
            }
            Err(e) => {
                // failed deliveries are dropped, never retried
                warn!(target: "scheduler", error = %e, "instant delivery failed, dropping");
                DeliveryDecision::Failed
            }
        }
    }

    /// Dispatch every entry due at `now`. One entry's failure never blocks
    /// the rest of the batch. Returns the number of dispatched entries.
    pub async fn flush_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<DelayedNotificationEntry> = {
            let mut queue = self.queue.lock().expect("delay queue poisoned");
            let (ready, pending): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|e| e.scheduled_at <= now);
            *queue = pending;
            gauge!("delay_queue_depth").set(queue.len() as f64);
            ready
        };

        let mut dispatched = 0usize;
        for entry in due {
            let _gate = self.decide_gate.lock().await;
            // the user may have been notified through another path while
            // this entry waited
            match self
                .store
                .is_notified_to_user(entry.user_id, entry.key.message_id, entry.key.group_id)
                .await
            {
                Ok(true) => {
                    counter!("notifications_suppressed_total").increment(1);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(target: "scheduler", error = %e, "flush dedup check failed, dropping entry");
                    counter!("flush_dispatch_failures_total").increment(1);
                    continue;
                }
            }

            let mut request = entry.request.clone();
            request.was_delayed = true;
            request.reasoning = with_delay_note(&request.reasoning);

            match self.sink.deliver(&request).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_notified(entry.key, Utc::now()).await {
                        warn!(target: "scheduler", error = %e, "mark_notified failed after flush delivery");
                        continue;
                    }
                    dispatched += 1;
                }
                Err(e) => {
                    warn!(
                        target: "scheduler",
                        user_id = entry.user_id,
                        message_id = entry.key.message_id,
                        error = %e,
                        "delayed delivery failed, dropping entry"
                    );
                    counter!("flush_dispatch_failures_total").increment(1);
                }
            }
        }
        if dispatched > 0 {
            counter!("notifications_delayed_dispatched_total").increment(dispatched as u64);
        }
        dispatched
    }

    /// Spawn the flush loop. The scheduler is constructed at startup and the
    /// returned handle is aborted at shutdown; `shutdown` logs what the
    /// in-memory queue loses.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                scheduler.params.flush_interval_secs.max(1),
            ));
            loop {
                ticker.tick().await;
                let dispatched = scheduler.flush_due(Utc::now()).await;
                if dispatched > 0 {
                    info!(target: "scheduler", dispatched, "flush tick");
                }
            }
        })
    }

    /// Log and drop whatever is still parked. Entries are never dispatched
    /// early, so shutdown loses them; the queue is in-memory only.
    pub fn shutdown(&self) {
        let dropped = {
            let mut queue = self.queue.lock().expect("delay queue poisoned");
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            warn!(
                target: "scheduler",
                dropped,
                "shutdown with undelivered delayed notifications"
            );
        }
    }
}

/// Assemble the structured delivery payload for one matched record.
pub fn build_request(
    record: &AnalysisRecord,
    message: &IncomingMessage,
    subscription: &Subscription,
    was_delayed: bool,
) -> NotificationRequest {
    let reasoning = record
        .verification_reasoning
        .clone()
        .unwrap_or_else(|| "Matched your subscription keywords.".to_string());
    NotificationRequest {
        recipient_id: record.user_id,
        subscription_id: record.subscription_id,
        group_id: record.group_id,
        message_id: record.message_id,
        group_title: message.group_title.clone(),
        group_username: message.group_username.clone(),
        sender_name: message.sender_name.clone(),
        sender_username: message.sender_username.clone(),
        excerpt: message.excerpt(EXCERPT_CHARS),
        query: subscription.query_text(),
        reasoning: if was_delayed {
            with_delay_note(&reasoning)
        } else {
            reasoning
        },
        media: message.media.clone(),
        was_delayed,
    }
}

/// User-facing disclosure appended to delayed notifications.
pub fn with_delay_note(reasoning: &str) -> String {
    format!(
        "{reasoning}\n\nThis notification was delayed because instant delivery is reserved for priority plans."
    )
}
