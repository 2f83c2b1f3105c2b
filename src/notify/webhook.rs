// src/notify/webhook.rs
//! Webhook sink: posts the structured notification to the delivery
//! collaborator with a small bounded retry loop.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::error::EngineError;
use crate::notify::NotificationSink;
use crate::types::NotificationRequest;

#[derive(Clone)]
pub struct WebhookSink {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl WebhookSink {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, request: &NotificationRequest) -> Result<(), EngineError> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(request)
                .send()
                .await;

            match res {
                Ok(rsp) => {
                    if let Err(e) = rsp.error_for_status_ref() {
                        if attempt < self.max_retries {
                            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1)))
                                .await;
                            continue;
                        }
                        return Err(EngineError::Delivery(format!(
                            "delivery webhook HTTP error: {e}"
                        )));
                    }
                    return Ok(());
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                        continue;
                    }
                    return Err(EngineError::Delivery(format!(
                        "delivery webhook request failed: {e}"
                    )));
                }
            }
        }
    }
}
