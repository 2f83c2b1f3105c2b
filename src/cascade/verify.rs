// src/cascade/verify.rs
//! Verification gate: the last and most expensive stage. Wraps an external
//! classification provider with bounded retries and a deterministic
//! fail-closed fallback: a borderline candidate is never promoted to
//! `matched` just because the service was down.

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::config::VerificationParams;

pub const ENV_VERIFY_TEST_MODE: &str = "VERIFY_TEST_MODE";
pub const ENV_VERIFY_PROVIDER: &str = "VERIFY_PROVIDER";
pub const ENV_VERIFY_MODEL: &str = "VERIFY_MODEL";

const MAX_REASONING_CHARS: usize = 300;

/// Verdict of the classification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    /// Confidence that the message truly satisfies the subscription intent.
    pub confidence: f32,
    pub reasoning: String,
}

/// Errors of one classification attempt.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Timeout, 5xx, rate limit; worth retrying.
    #[error("transient verification failure: {0}")]
    Transient(String),

    /// Unparseable provider output; treated like a transient failure.
    #[error("malformed verification response: {0}")]
    Malformed(String),

    /// Missing key or rejected credentials; retrying cannot help.
    #[error("verification provider not configured: {0}")]
    NotConfigured(String),
}

/// Subscription-side context handed to the classifier.
#[derive(Debug, Clone)]
pub struct VerifyContext<'a> {
    pub query: &'a str,
    pub positive_keywords: &'a [String],
    pub lexical_score: f32,
    pub semantic_score: Option<f32>,
}

/// Low-level provider: does one real remote classification call. Separated
/// from the gate so retry policy and fallback are provider-independent.
#[async_trait]
pub trait VerifyProvider: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        ctx: &VerifyContext<'_>,
    ) -> Result<Verification, VerifyError>;

    fn name(&self) -> &'static str;
}

/// Collapse whitespace and cap length; provider output goes into user-facing
/// notifications and into the store, so it must stay single-line and short.
pub fn sanitize_reasoning(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_REASONING_CHARS * 4));
    let mut prev_space = false;
    for ch in input.chars() {
        let c = if ch.is_whitespace() { ' ' } else { ch };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
        if out.chars().count() >= MAX_REASONING_CHARS {
            break;
        }
    }
    out.trim().to_string()
}

// ------------------------------------------------------------
// Providers
// ------------------------------------------------------------

/// OpenAI-compatible chat-completions provider. Requires `OPENAI_API_KEY`.
pub struct OpenAiVerifier {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiVerifier {
    pub fn new(model_override: Option<&str>, params: VerificationParams) -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        let http = reqwest::Client::builder()
            .user_agent("groupwatch/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(params.request_timeout_secs))
            .build()
            .expect("reqwest client");
        let model = model_override.unwrap_or("gpt-4o-mini").to_string();
        Self {
            http,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl VerifyProvider for OpenAiVerifier {
    async fn classify(
        &self,
        text: &str,
        ctx: &VerifyContext<'_>,
    ) -> Result<Verification, VerifyError> {
        if self.api_key.is_empty() {
            return Err(VerifyError::NotConfigured("OPENAI_API_KEY is empty".into()));
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let sys = "You judge whether a chat message satisfies a user's standing search intent. \
                   Reply with ONLY a JSON object: {\"confidence\": <0..1 float>, \"reasoning\": \"<one short sentence>\"}. \
                   confidence is the probability the message genuinely offers what the user is looking for.";
        let user = format!(
            "User intent (keywords): {}\nLexical score: {:.2}\nSemantic score: {}\n\nMessage:\n{}",
            ctx.query,
            ctx.lexical_score,
            ctx.semantic_score
                .map(|s| format!("{s:.2}"))
                .unwrap_or_else(|| "unavailable".to_string()),
            text
        );
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: sys,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.0,
            max_tokens: 160,
        };

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| VerifyError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(VerifyError::NotConfigured(format!(
                "provider rejected credentials ({status})"
            )));
        }
        if !status.is_success() {
            return Err(VerifyError::Transient(format!("provider status {status}")));
        }

        let body: Resp = resp
            .json()
            .await
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");

        parse_verdict(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Parse the model's JSON verdict, tolerating a markdown code fence.
fn parse_verdict(content: &str) -> Result<Verification, VerifyError> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let mut v: Verification = serde_json::from_str(trimmed)
        .map_err(|e| VerifyError::Malformed(format!("{e}; content: {trimmed:.120}")))?;
    if !v.confidence.is_finite() {
        return Err(VerifyError::Malformed("non-finite confidence".into()));
    }
    v.confidence = v.confidence.clamp(0.0, 1.0);
    v.reasoning = sanitize_reasoning(&v.reasoning);
    Ok(v)
}

/// Used when no provider is configured; the gate falls back immediately.
pub struct DisabledVerifier;

#[async_trait]
impl VerifyProvider for DisabledVerifier {
    async fn classify(
        &self,
        _text: &str,
        _ctx: &VerifyContext<'_>,
    ) -> Result<Verification, VerifyError> {
        Err(VerifyError::NotConfigured(
            "no verification provider configured".into(),
        ))
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Deterministic provider for tests and local runs.
#[derive(Clone)]
pub struct MockVerifier {
    pub fixed: Verification,
}

impl MockVerifier {
    pub fn confident() -> Self {
        Self {
            fixed: Verification {
                confidence: 0.9,
                reasoning: "Mock verification verdict".to_string(),
            },
        }
    }
}

#[async_trait]
impl VerifyProvider for MockVerifier {
    async fn classify(
        &self,
        _text: &str,
        _ctx: &VerifyContext<'_>,
    ) -> Result<Verification, VerifyError> {
        Ok(self.fixed.clone())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Factory: build a provider according to environment.
///
/// * `VERIFY_TEST_MODE=mock` returns a deterministic mock.
/// * `VERIFY_PROVIDER=openai` builds the real provider (key from env).
/// * Anything else is disabled, which makes the gate fail closed.
pub fn build_verifier_from_env(params: VerificationParams) -> Arc<dyn VerifyProvider> {
    if std::env::var(ENV_VERIFY_TEST_MODE)
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Arc::new(MockVerifier::confident());
    }
    match std::env::var(ENV_VERIFY_PROVIDER).ok().as_deref() {
        Some("openai") => {
            let model = std::env::var(ENV_VERIFY_MODEL).ok();
            Arc::new(OpenAiVerifier::new(model.as_deref(), params))
        }
        _ => Arc::new(DisabledVerifier),
    }
}

// ------------------------------------------------------------
// Gate
// ------------------------------------------------------------

/// Retry wrapper around a provider. `verify` never errors: on an exhausted
/// budget it returns the fail-closed fallback verdict.
#[derive(Clone)]
pub struct VerificationGate {
    provider: Arc<dyn VerifyProvider>,
    params: VerificationParams,
}

impl VerificationGate {
    pub fn new(provider: Arc<dyn VerifyProvider>, params: VerificationParams) -> Self {
        Self { provider, params }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    fn fallback(&self, detail: &str) -> Verification {
        counter!("verification_fallback_total").increment(1);
        Verification {
            confidence: 0.0,
            reasoning: format!("Verification service unavailable ({detail}); failing closed."),
        }
    }

    /// Classify with bounded attempts and exponential backoff. The retry
    /// budget is bounded both in count and in total elapsed time.
    pub async fn verify(&self, text: &str, ctx: &VerifyContext<'_>) -> Verification {
        let started = Instant::now();
        let budget = Duration::from_secs(
            self.params.request_timeout_secs * u64::from(self.params.max_attempts.max(1)),
        );

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.provider.classify(text, ctx).await {
                Ok(v) => return v,
                Err(VerifyError::NotConfigured(detail)) => {
                    // retrying cannot fix configuration
                    return self.fallback(&detail);
                }
                Err(e) => {
                    if attempt >= self.params.max_attempts.max(1) {
                        warn!(
                            target: "cascade",
                            provider = self.provider.name(),
                            attempts = attempt,
                            error = %e,
                            "verification retries exhausted"
                        );
                        return self.fallback("retries exhausted");
                    }
                    let backoff =
                        Duration::from_millis(self.params.backoff_base_ms << (attempt - 1));
                    if started.elapsed() + backoff >= budget {
                        warn!(
                            target: "cascade",
                            provider = self.provider.name(),
                            attempts = attempt,
                            "verification time budget exhausted"
                        );
                        return self.fallback("time budget exhausted");
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyVerifier {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl VerifyProvider for FlakyVerifier {
        async fn classify(
            &self,
            _text: &str,
            _ctx: &VerifyContext<'_>,
        ) -> Result<Verification, VerifyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(VerifyError::Transient("boom".into()))
            } else {
                Ok(Verification {
                    confidence: 0.8,
                    reasoning: "recovered".into(),
                })
            }
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn ctx<'a>(query: &'a str, keywords: &'a [String]) -> VerifyContext<'a> {
        VerifyContext {
            query,
            positive_keywords: keywords,
            lexical_score: 0.8,
            semantic_score: Some(0.82),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gate_recovers_from_transient_failures() {
        let provider = Arc::new(FlakyVerifier {
            fail_first: 2,
            calls: AtomicU32::new(0),
        });
        let gate = VerificationGate::new(provider.clone(), VerificationParams::default());
        let keywords = vec!["велосипед".to_string()];
        let v = gate.verify("Продам велосипед", &ctx("велосипед", &keywords)).await;
        assert_eq!(v.reasoning, "recovered");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_fails_closed_after_exhausted_retries() {
        let provider = Arc::new(FlakyVerifier {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let gate = VerificationGate::new(provider.clone(), VerificationParams::default());
        let keywords = vec!["велосипед".to_string()];
        let v = gate.verify("Продам велосипед", &ctx("велосипед", &keywords)).await;
        assert_eq!(v.confidence, 0.0);
        assert!(v.reasoning.contains("unavailable"));
        assert_eq!(
            provider.calls.load(Ordering::SeqCst),
            VerificationParams::default().max_attempts
        );
    }

    #[tokio::test]
    async fn disabled_provider_falls_back_without_retrying() {
        let gate = VerificationGate::new(Arc::new(DisabledVerifier), VerificationParams::default());
        let keywords = vec!["bike".to_string()];
        let v = gate.verify("anything", &ctx("bike", &keywords)).await;
        assert_eq!(v.confidence, 0.0);
        assert!(v.reasoning.contains("failing closed"));
    }

    #[test]
    fn verdict_parsing_tolerates_code_fences() {
        let v = parse_verdict("```json\n{\"confidence\": 0.93, \"reasoning\": \"direct offer\"}\n```")
            .expect("parse");
        assert!((v.confidence - 0.93).abs() < 1e-6);
        assert_eq!(v.reasoning, "direct offer");
    }

    #[test]
    fn verdict_parsing_clamps_and_rejects_garbage() {
        let v = parse_verdict("{\"confidence\": 3.0, \"reasoning\": \"x\"}").expect("parse");
        assert_eq!(v.confidence, 1.0);
        assert!(parse_verdict("not json at all").is_err());
    }

    #[test]
    fn reasoning_is_collapsed_and_capped() {
        let s = sanitize_reasoning("  line one\n\n   line\ttwo  ");
        assert_eq!(s, "line one line two");
        let long = "слово ".repeat(200);
        assert!(sanitize_reasoning(&long).chars().count() <= MAX_REASONING_CHARS);
    }
}
