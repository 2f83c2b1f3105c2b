// src/error.rs
//! Engine error taxonomy. Transient external failures are handled inside the
//! stages that produce them (semantic degradation, verification fallback);
//! what surfaces here is what a caller can actually act on.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("embedding service error: {0}")]
    Embedding(String),

    #[error("verification provider error: {0}")]
    Verification(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(i64),
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(format!("serialized column: {e}"))
    }
}
