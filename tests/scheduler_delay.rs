// tests/scheduler_delay.rs
// Tiered delivery policy: priority users ship instantly, free users are
// delayed only when a priority user already got the same match, and the
// flush loop dispatches due entries exactly once.

use std::sync::Arc;

use chrono::{Duration, Utc};

use groupwatch::config::SchedulerParams;
use groupwatch::notify::MemorySink;
use groupwatch::scheduler::{
    DeliveryDecision, NotificationScheduler, StaticPlanResolver,
};
use groupwatch::store::{AnalysisStore, MemoryStore};
use groupwatch::types::{
    AnalysisOutcome, AnalysisRecord, IncomingMessage, PlanTier, Subscription,
};

const GROUP: i64 = -100555;
const MESSAGE: i64 = 1002;

fn message() -> IncomingMessage {
    IncomingMessage {
        group_id: GROUP,
        message_id: MESSAGE,
        text: "Продам велосипед б/у".to_string(),
        sender_id: 42,
        sender_name: "seller".to_string(),
        sender_username: Some("seller_tg".to_string()),
        group_title: Some("Flea market".to_string()),
        group_username: None,
        timestamp: Utc::now(),
        media: Vec::new(),
    }
}

fn subscription(id: i64, user_id: i64) -> Subscription {
    let now = Utc::now();
    Subscription {
        id,
        user_id,
        group_id: GROUP,
        positive_keywords: vec!["велосипед".to_string()],
        negative_keywords: Vec::new(),
        disabled_negative_keywords: Vec::new(),
        keyword_embedding: None,
        active: true,
        paused: false,
        created_at: now,
        updated_at: now,
    }
}

fn matched_record(subscription_id: i64, user_id: i64) -> AnalysisRecord {
    AnalysisRecord {
        subscription_id,
        user_id,
        group_id: GROUP,
        message_id: MESSAGE,
        outcome: AnalysisOutcome::Matched,
        lexical_score: Some(1.0),
        semantic_score: Some(0.82),
        verification_confidence: Some(0.9),
        rejection_keyword: None,
        verification_reasoning: Some("Direct offer of a used bike".to_string()),
        evaluated_at: Utc::now(),
        notified_at: None,
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    sink: Arc<MemorySink>,
    scheduler: Arc<NotificationScheduler>,
}

fn fixture(priority_users: &[i64]) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let mut plans = StaticPlanResolver::new(PlanTier::Free);
    for &id in priority_users {
        plans = plans.with_tier(id, PlanTier::Pro);
    }
    let scheduler = Arc::new(NotificationScheduler::new(
        store.clone(),
        Arc::new(plans),
        sink.clone(),
        SchedulerParams::default(),
    ));
    Fixture {
        store,
        sink,
        scheduler,
    }
}

#[tokio::test]
async fn priority_user_is_delivered_instantly() {
    let f = fixture(&[100]);
    let record = matched_record(1, 100);
    f.store.save(&record).await.unwrap();

    let decision = f
        .scheduler
        .decide(&record, &message(), &subscription(1, 100))
        .await;
    assert_eq!(decision, DeliveryDecision::DeliveredInstant);

    let delivered = f.sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert!(!delivered[0].was_delayed);
    assert_eq!(delivered[0].recipient_id, 100);
    assert!(f.store.is_notified_to_user(100, MESSAGE, GROUP).await.unwrap());
}

#[tokio::test]
async fn free_user_without_competition_is_delivered_instantly() {
    let f = fixture(&[]);
    let record = matched_record(2, 200);
    f.store.save(&record).await.unwrap();

    let decision = f
        .scheduler
        .decide(&record, &message(), &subscription(2, 200))
        .await;
    assert_eq!(decision, DeliveryDecision::DeliveredInstant);
    assert_eq!(f.scheduler.queue_depth(), 0);
    assert_eq!(f.sink.delivered().len(), 1);
}

#[tokio::test]
async fn free_user_behind_priority_match_is_delayed_by_the_constant() {
    let f = fixture(&[100]);

    // priority user already notified at t0
    let priority = matched_record(1, 100);
    f.store.save(&priority).await.unwrap();
    let t0 = Utc::now();
    assert!(f.store.mark_notified(priority.key(), t0).await.unwrap());

    // free-tier decision one second later
    let free = matched_record(2, 200);
    f.store.save(&free).await.unwrap();
    let decision_time = t0 + Duration::seconds(1);
    let decision = f
        .scheduler
        .decide_at(decision_time, &free, &message(), &subscription(2, 200))
        .await;

    let expected = decision_time + Duration::seconds(240);
    assert_eq!(decision, DeliveryDecision::Delayed(expected));
    assert_eq!(f.scheduler.queue_depth(), 1);
    // nothing delivered yet
    assert_eq!(f.sink.delivered().len(), 0);
}

#[tokio::test]
async fn flush_dispatches_only_due_entries_with_a_delay_note() {
    let f = fixture(&[100]);

    let priority = matched_record(1, 100);
    f.store.save(&priority).await.unwrap();
    let t0 = Utc::now();
    f.store.mark_notified(priority.key(), t0).await.unwrap();

    let free = matched_record(2, 200);
    f.store.save(&free).await.unwrap();
    let decision_time = t0 + Duration::seconds(1);
    f.scheduler
        .decide_at(decision_time, &free, &message(), &subscription(2, 200))
        .await;

    // not due yet: nothing moves
    let early = decision_time + Duration::seconds(239);
    assert_eq!(f.scheduler.flush_due(early).await, 0);
    assert_eq!(f.scheduler.queue_depth(), 1);

    // due: dispatched once, with the disclosure note, and marked notified
    let due = decision_time + Duration::seconds(240);
    assert_eq!(f.scheduler.flush_due(due).await, 1);
    assert_eq!(f.scheduler.queue_depth(), 0);

    let delivered = f.sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].was_delayed);
    assert!(delivered[0].reasoning.contains("delayed"));
    assert!(f.store.is_notified_to_user(200, MESSAGE, GROUP).await.unwrap());

    // a later flush does not re-dispatch
    assert_eq!(f.scheduler.flush_due(due + Duration::seconds(60)).await, 0);
}

#[tokio::test]
async fn flush_skips_users_already_notified_through_another_path() {
    let f = fixture(&[100]);

    let priority = matched_record(1, 100);
    f.store.save(&priority).await.unwrap();
    let t0 = Utc::now();
    f.store.mark_notified(priority.key(), t0).await.unwrap();

    // user 200 parks an entry behind the priority match
    let delayed = matched_record(2, 200);
    f.store.save(&delayed).await.unwrap();
    let decision_time = t0 + Duration::seconds(1);
    f.scheduler
        .decide_at(decision_time, &delayed, &message(), &subscription(2, 200))
        .await;

    // meanwhile another subscription of the same user gets marked notified
    let other = matched_record(3, 200);
    f.store.save(&other).await.unwrap();
    f.store
        .mark_notified(other.key(), decision_time + Duration::seconds(2))
        .await
        .unwrap();

    let due = decision_time + Duration::seconds(240);
    assert_eq!(f.scheduler.flush_due(due).await, 0);
    assert_eq!(f.scheduler.queue_depth(), 0, "entry is consumed, not retried");
    assert_eq!(f.sink.delivered().len(), 0);
}

#[tokio::test]
async fn one_failing_dispatch_does_not_block_the_batch() {
    let f = fixture(&[100]);

    let priority = matched_record(1, 100);
    f.store.save(&priority).await.unwrap();
    let t0 = Utc::now();
    f.store.mark_notified(priority.key(), t0).await.unwrap();

    let decision_time = t0 + Duration::seconds(1);
    for (sub_id, user_id) in [(2, 200), (3, 300)] {
        let rec = matched_record(sub_id, user_id);
        f.store.save(&rec).await.unwrap();
        f.scheduler
            .decide_at(decision_time, &rec, &message(), &subscription(sub_id, user_id))
            .await;
    }
    assert_eq!(f.scheduler.queue_depth(), 2);

    f.sink.fail_for(200);
    let due = decision_time + Duration::seconds(240);
    assert_eq!(f.scheduler.flush_due(due).await, 1);

    // the failed entry is dropped, not requeued
    assert_eq!(f.scheduler.queue_depth(), 0);
    let delivered = f.sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].recipient_id, 300);
    assert!(!f.store.is_notified_to_user(200, MESSAGE, GROUP).await.unwrap());
}

#[tokio::test]
async fn duplicate_decide_for_the_same_user_is_suppressed() {
    let f = fixture(&[]);
    let record = matched_record(2, 200);
    f.store.save(&record).await.unwrap();

    let first = f
        .scheduler
        .decide(&record, &message(), &subscription(2, 200))
        .await;
    let second = f
        .scheduler
        .decide(&record, &message(), &subscription(2, 200))
        .await;

    assert_eq!(first, DeliveryDecision::DeliveredInstant);
    assert_eq!(second, DeliveryDecision::AlreadyNotified);
    assert_eq!(f.sink.delivered().len(), 1);
}

#[tokio::test]
async fn concurrent_matches_for_one_user_notify_once() {
    let f = fixture(&[]);
    let rec_a = matched_record(2, 200);
    let rec_b = matched_record(3, 200);
    f.store.save(&rec_a).await.unwrap();
    f.store.save(&rec_b).await.unwrap();

    let msg = message();
    let sub_a = subscription(2, 200);
    let sub_b = subscription(3, 200);
    let (da, db) = tokio::join!(
        f.scheduler.decide(&rec_a, &msg, &sub_a),
        f.scheduler.decide(&rec_b, &msg, &sub_b),
    );

    let instant = [da, db]
        .iter()
        .filter(|d| **d == DeliveryDecision::DeliveredInstant)
        .count();
    assert_eq!(instant, 1, "exactly one subscription wins delivery");
    assert_eq!(f.sink.delivered().len(), 1);
}

#[tokio::test]
async fn shutdown_drops_parked_entries() {
    let f = fixture(&[100]);
    let priority = matched_record(1, 100);
    f.store.save(&priority).await.unwrap();
    let t0 = Utc::now();
    f.store.mark_notified(priority.key(), t0).await.unwrap();

    let free = matched_record(2, 200);
    f.store.save(&free).await.unwrap();
    f.scheduler
        .decide_at(t0 + Duration::seconds(1), &free, &message(), &subscription(2, 200))
        .await;
    assert_eq!(f.scheduler.queue_depth(), 1);

    f.scheduler.shutdown();
    assert_eq!(f.scheduler.queue_depth(), 0);
    assert_eq!(f.sink.delivered().len(), 0);
}
