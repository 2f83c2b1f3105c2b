//! Subscription Matching Service — Binary Entrypoint
//! Boots the Axum ingress, wiring the store, the cascade and the scheduler.
//!
//! See `README.md` for quickstart.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use groupwatch::api::{create_router, AppState};
use groupwatch::cascade::{build_verifier_from_env, MatchOrchestrator};
use groupwatch::config::MatchingConfig;
use groupwatch::embedding::{EmbeddingProvider, HttpEmbedder, MockEmbedder};
use groupwatch::jobs::spawn_embedding_backfill;
use groupwatch::telemetry::Metrics;
use groupwatch::notify::{NoopSink, NotificationSink, WebhookSink};
use groupwatch::scheduler::{NotificationScheduler, StaticPlanResolver};
use groupwatch::store::SqliteStore;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn build_embedder(cfg: &MatchingConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match std::env::var("EMBED_SERVICE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let embedder = HttpEmbedder::new(&url, cfg.embedding)?;
            Ok(Arc::new(embedder))
        }
        _ => {
            warn!("EMBED_SERVICE_URL not set; semantic stage will be unavailable");
            // an empty mock never has vectors, so every embed degrades to
            // the documented fall-through
            Ok(Arc::new(MockEmbedder::new(cfg.embedding.dimension)))
        }
    }
}

fn build_sink() -> Arc<dyn NotificationSink> {
    match std::env::var("DELIVERY_WEBHOOK_URL") {
        Ok(url) if !url.trim().is_empty() => Arc::new(WebhookSink::new(url)),
        _ => {
            warn!("DELIVERY_WEBHOOK_URL not set; notifications are logged and dropped");
            Arc::new(NoopSink)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = MatchingConfig::load().context("load matching config")?;

    let db_path =
        std::env::var("GROUPWATCH_DB_PATH").unwrap_or_else(|_| "sqlite://groupwatch.db".into());
    let store = Arc::new(SqliteStore::connect(&db_path).await?);

    let embedder = build_embedder(&cfg)?;
    let verifier = build_verifier_from_env(cfg.verification);
    let sink = build_sink();
    let plans = Arc::new(StaticPlanResolver::from_env());

    let scheduler = Arc::new(NotificationScheduler::new(
        store.clone(),
        plans,
        sink,
        cfg.scheduler,
    ));
    let flush_handle = scheduler.spawn_flush_loop();
    let backfill_handle = spawn_embedding_backfill(
        store.clone(),
        embedder.clone(),
        cfg.embedding.backfill_interval_secs,
    );

    let orchestrator = Arc::new(MatchOrchestrator::new(
        &cfg,
        embedder,
        verifier,
        store.clone(),
        scheduler.clone(),
    ));

    let metrics = Metrics::init(cfg.scheduler.priority_delay_secs * 1000);
    let state = AppState {
        orchestrator,
        subscriptions: store.clone(),
        analysis: store,
    };
    let app = create_router(state).merge(metrics.router());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind port {port}"))?;
    info!(port, "groupwatch listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    flush_handle.abort();
    backfill_handle.abort();
    scheduler.shutdown();
    Ok(())
}
