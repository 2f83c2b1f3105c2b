// tests/api_http.rs
// Ingress adapter tests via tower::oneshot, without binding a port.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use tower::ServiceExt;

use groupwatch::api::{create_router, AppState};
use groupwatch::cascade::{MatchOrchestrator, MockVerifier};
use groupwatch::config::MatchingConfig;
use groupwatch::embedding::MockEmbedder;
use groupwatch::notify::MemorySink;
use groupwatch::scheduler::{NotificationScheduler, StaticPlanResolver};
use groupwatch::store::{MemoryStore, NewSubscription, SubscriptionStore};
use groupwatch::types::PlanTier;

fn app_with_store() -> (axum::Router, Arc<MemoryStore>) {
    let cfg = MatchingConfig::default();
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let scheduler = Arc::new(NotificationScheduler::new(
        store.clone(),
        Arc::new(StaticPlanResolver::new(PlanTier::Free)),
        sink,
        cfg.scheduler,
    ));
    let orchestrator = Arc::new(MatchOrchestrator::new(
        &cfg,
        Arc::new(MockEmbedder::new(2)),
        Arc::new(MockVerifier::confident()),
        store.clone(),
        scheduler,
    ));
    let state = AppState {
        orchestrator,
        subscriptions: store.clone(),
        analysis: store.clone(),
    };
    (create_router(state), store)
}

async fn body_json(body: Body) -> serde_json::Value {
    let bytes = to_bytes(body, 1024 * 1024).await.expect("read body");
    serde_json::from_slice(&bytes).expect("parse body json")
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _) = app_with_store();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn subscription_creation_validates_keywords() {
    let (app, _) = app_with_store();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/subscriptions")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "user_id": 7,
                        "group_id": -100555,
                        "positive_keywords": ["  "]
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn message_ingest_evaluates_group_subscriptions() {
    let (app, store) = app_with_store();
    store
        .insert_subscription(NewSubscription {
            user_id: 7,
            group_id: -100555,
            positive_keywords: vec!["велосипед".into()],
            negative_keywords: vec![],
        })
        .await
        .unwrap();

    let message = serde_json::json!({
        "group_id": -100555,
        "message_id": 1002,
        "text": "Продам велосипед б/у",
        "sender_id": 42,
        "sender_name": "seller",
        "timestamp": Utc::now().to_rfc3339(),
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/messages")
                .header("content-type", "application/json")
                .body(Body::from(message.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["evaluated"], 1);
    assert_eq!(json["matched"], 1);
    assert_eq!(json["outcomes"][0]["outcome"], "matched");

    // stored records are inspectable
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/analysis/-100555/1002")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let rows = body_json(response.into_body()).await;
    assert_eq!(rows.as_array().map(|a| a.len()), Some(1));
    assert_eq!(rows[0]["outcome"], "matched");
    assert!(rows[0]["notified_at"].is_string());
}

#[tokio::test]
async fn message_for_group_without_subscriptions_is_a_noop() {
    let (app, _) = app_with_store();
    let message = serde_json::json!({
        "group_id": -1,
        "message_id": 1,
        "text": "anything",
        "sender_id": 1,
        "sender_name": "x",
        "timestamp": Utc::now().to_rfc3339(),
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/messages")
                .header("content-type", "application/json")
                .body(Body::from(message.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["evaluated"], 0);
    assert_eq!(json["matched"], 0);
}
