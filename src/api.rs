// src/api.rs
//! Ingress adapter: the seam where the transport collaborator hands messages
//! to the engine and manages subscription rows. The cascade itself never
//! depends on this module.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::cascade::MatchOrchestrator;
use crate::store::{AnalysisStore, NewSubscription, SubscriptionStore};
use crate::types::{AnalysisOutcome, AnalysisRecord, IncomingMessage, Subscription};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<MatchOrchestrator>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub analysis: Arc<dyn AnalysisStore>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/messages", post(ingest_message))
        .route("/api/subscriptions", post(create_subscription))
        .route(
            "/api/analysis/{group_id}/{message_id}",
            get(analysis_for_message),
        )
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(serde::Serialize)]
struct OutcomeOut {
    subscription_id: i64,
    outcome: AnalysisOutcome,
    lexical_score: Option<f32>,
    semantic_score: Option<f32>,
    verification_confidence: Option<f32>,
    rejection_keyword: Option<String>,
}

impl From<&AnalysisRecord> for OutcomeOut {
    fn from(r: &AnalysisRecord) -> Self {
        Self {
            subscription_id: r.subscription_id,
            outcome: r.outcome,
            lexical_score: r.lexical_score,
            semantic_score: r.semantic_score,
            verification_confidence: r.verification_confidence,
            rejection_keyword: r.rejection_keyword.clone(),
        }
    }
}

#[derive(serde::Serialize)]
struct IngestResp {
    evaluated: usize,
    matched: usize,
    outcomes: Vec<OutcomeOut>,
}

async fn ingest_message(
    State(state): State<AppState>,
    Json(message): Json<IncomingMessage>,
) -> Result<Json<IngestResp>, (StatusCode, String)> {
    let subs = state
        .subscriptions
        .active_subscriptions_for_group(message.group_id)
        .await
        .map_err(internal)?;

    let records = state.orchestrator.evaluate(&message, subs).await;
    let matched = records.iter().filter(|r| r.is_matched()).count();
    Ok(Json(IngestResp {
        evaluated: records.len(),
        matched,
        outcomes: records.iter().map(OutcomeOut::from).collect(),
    }))
}

async fn create_subscription(
    State(state): State<AppState>,
    Json(new): Json<NewSubscription>,
) -> Result<(StatusCode, Json<Subscription>), (StatusCode, String)> {
    if new.positive_keywords.iter().all(|k| k.trim().is_empty()) {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "positive_keywords must not be empty".to_string(),
        ));
    }
    let sub = state
        .subscriptions
        .insert_subscription(new)
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(sub)))
}

async fn analysis_for_message(
    State(state): State<AppState>,
    Path((group_id, message_id)): Path<(i64, i64)>,
) -> Result<Json<Vec<AnalysisRecord>>, (StatusCode, String)> {
    let records = state
        .analysis
        .analysis_for_message(group_id, message_id)
        .await
        .map_err(internal)?;
    Ok(Json(records))
}

fn internal(e: crate::error::EngineError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
