// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod config;
pub mod embedding;
pub mod error;
pub mod normalize;
pub mod types;

// Matching cascade (lexical, semantic, verification, orchestration)
pub mod cascade;

// Durable analysis/subscription store
pub mod store;

// Notifications & background jobs
pub mod jobs;
pub mod notify;
pub mod scheduler;

pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::cascade::MatchOrchestrator;
pub use crate::config::MatchingConfig;
pub use crate::error::EngineError;
pub use crate::scheduler::{DeliveryDecision, NotificationScheduler, PlanResolver};
pub use crate::types::{
    AnalysisOutcome, AnalysisRecord, IncomingMessage, NotificationRequest, PlanTier, Subscription,
};
