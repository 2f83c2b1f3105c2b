// src/notify/mod.rs
//! Delivery capability. The engine hands a structured `NotificationRequest`
//! to a `NotificationSink`; whatever transport sits behind the sink is not
//! the engine's business. Sinks are injected at construction time.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::error::EngineError;
use crate::types::NotificationRequest;

pub mod webhook;

pub use webhook::WebhookSink;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, request: &NotificationRequest) -> Result<(), EngineError>;
}

/// Logs and drops; used when no delivery endpoint is configured.
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn deliver(&self, request: &NotificationRequest) -> Result<(), EngineError> {
        tracing::info!(
            target: "notify",
            recipient = request.recipient_id,
            subscription_id = request.subscription_id,
            message_id = request.message_id,
            delayed = request.was_delayed,
            "dry-run delivery (no sink configured)"
        );
        Ok(())
    }
}

/// Records deliveries for assertions in tests.
#[derive(Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<NotificationRequest>>,
    fail_recipients: Mutex<Vec<i64>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deliveries to `recipient_id` fail; exercises drop-on-failure paths.
    pub fn fail_for(&self, recipient_id: i64) {
        self.fail_recipients
            .lock()
            .expect("sink poisoned")
            .push(recipient_id);
    }

    pub fn delivered(&self) -> Vec<NotificationRequest> {
        self.delivered.lock().expect("sink poisoned").clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(&self, request: &NotificationRequest) -> Result<(), EngineError> {
        if self
            .fail_recipients
            .lock()
            .expect("sink poisoned")
            .contains(&request.recipient_id)
        {
            return Err(EngineError::Delivery(format!(
                "simulated failure for recipient {}",
                request.recipient_id
            )));
        }
        self.delivered
            .lock()
            .expect("sink poisoned")
            .push(request.clone());
        Ok(())
    }
}
