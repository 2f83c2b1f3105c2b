// src/embedding.rs
//! Embedding service client. The engine treats embedding as a possibly slow,
//! possibly failing collaborator: every caller must tolerate `Err` without
//! crashing the cascade.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::EmbeddingParams;

/// Errors of the embedding layer.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("embedding service returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },

    #[error("embedding provider not configured: {0}")]
    NotConfigured(String),
}

/// Text → fixed-dimension vector. Implementations must be Send + Sync so a
/// single provider can serve many concurrent evaluations.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Dimension of the vectors this provider produces.
    fn dimension(&self) -> usize;
}

#[derive(Serialize)]
struct EmbedSingleRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedSingleResponse {
    embedding: Vec<f32>,
}

/// HTTP client for the embedding server (`POST /embed/single`).
pub struct HttpEmbedder {
    http: reqwest::Client,
    base_url: String,
    dim: usize,
}

impl HttpEmbedder {
    /// `base_url` without a trailing slash, e.g. `http://127.0.0.1:8080`.
    pub fn new(base_url: &str, params: EmbeddingParams) -> Result<Self, EmbeddingError> {
        if base_url.trim().is_empty() {
            return Err(EmbeddingError::NotConfigured(
                "EMBED_SERVICE_URL is required for the http embedding provider".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .user_agent("groupwatch/0.1")
            .connect_timeout(Duration::from_secs(params.connect_timeout_secs))
            .timeout(Duration::from_secs(params.request_timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            dim: params.dimension,
        })
    }

    /// Probe the service's health endpoint; used at startup for diagnostics.
    pub async fn health(&self) -> Result<(), EmbeddingError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EmbeddingError::Api {
                status: resp.status().as_u16(),
                message: "health check failed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/embed/single", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&EmbedSingleRequest { text })
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbedSingleResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Request(format!("malformed embedding response: {e}")))?;

        if body.embedding.len() != self.dim {
            return Err(EmbeddingError::Dimension {
                expected: self.dim,
                got: body.embedding.len(),
            });
        }
        Ok(body.embedding)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// Deterministic provider for tests and local runs: returns vectors from a
/// preloaded text → vector map, or an error for unknown texts.
pub struct MockEmbedder {
    dim: usize,
    vectors: Mutex<HashMap<String, Vec<f32>>>,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, text: &str, vector: Vec<f32>) {
        self.vectors
            .lock()
            .expect("mock embedder poisoned")
            .insert(text.to_string(), vector);
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.vectors
            .lock()
            .expect("mock embedder poisoned")
            .get(text)
            .cloned()
            .ok_or_else(|| EmbeddingError::Request(format!("no mock vector for {text:?}")))
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// Provider that always fails; used to exercise degradation paths.
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Request("embedding service down".to_string()))
    }

    fn dimension(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedder_returns_inserted_vectors() {
        let mock = MockEmbedder::new(3);
        mock.insert("bike", vec![1.0, 0.0, 0.0]);
        assert_eq!(mock.embed("bike").await.unwrap(), vec![1.0, 0.0, 0.0]);
        assert!(mock.embed("unknown").await.is_err());
    }

    #[test]
    fn http_embedder_requires_base_url() {
        let err = HttpEmbedder::new("", EmbeddingParams::default());
        assert!(matches!(err, Err(EmbeddingError::NotConfigured(_))));
    }
}
