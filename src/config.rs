// src/config.rs
//! Matching configuration: thresholds and stage parameters loaded from
//! `config/matching.toml`, with environment overrides for the three cascade
//! thresholds so operators can tune without a redeploy.

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_MATCHING_CONFIG_PATH: &str = "config/matching.toml";

pub const ENV_MATCHING_CONFIG_PATH: &str = "MATCHING_CONFIG_PATH";
pub const ENV_LEXICAL_THRESHOLD: &str = "MATCHING_LEXICAL_THRESHOLD";
pub const ENV_SEMANTIC_THRESHOLD: &str = "MATCHING_SEMANTIC_THRESHOLD";
pub const ENV_CONFIDENCE_THRESHOLD: &str = "MATCHING_CONFIDENCE_THRESHOLD";

// parse optional float env and clamp to <0.0..=1.0>
fn parse_threshold_env(raw: Option<String>) -> Option<f32> {
    raw.and_then(|s| s.trim().parse::<f32>().ok())
        .map(|v| v.clamp(0.0, 1.0))
}

/// Pass thresholds of the three cascade stages.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub lexical: f32,
    pub semantic: f32,
    pub confidence: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            lexical: 0.45,
            semantic: 0.75,
            confidence: 0.70,
        }
    }
}

/// Knobs of the lexical stage.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LexicalParams {
    pub ngram_size: usize,
    pub shingle_size: usize,
    /// N-gram containment floor above which a negative keyword vetoes.
    pub negative_ngram_floor: f32,
    /// N-gram containment floor above which a positive keyword counts as a hit.
    pub positive_ngram_floor: f32,
    /// Jaro-Winkler floor for fuzzy single-token hits.
    pub fuzzy_token_floor: f64,
    /// Weight of the word-shingle bonus for multi-word keywords.
    pub shingle_bonus_weight: f32,
}

impl Default for LexicalParams {
    fn default() -> Self {
        Self {
            ngram_size: 3,
            shingle_size: 2,
            negative_ngram_floor: 0.60,
            positive_ngram_floor: 0.55,
            fuzzy_token_floor: 0.92,
            shingle_bonus_weight: 0.25,
        }
    }
}

/// Delivery-latency policy of the scheduler.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SchedulerParams {
    /// Competitive delay applied to non-priority users (seconds).
    pub priority_delay_secs: u64,
    /// Delay-queue flush tick (seconds).
    pub flush_interval_secs: u64,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            priority_delay_secs: 240,
            flush_interval_secs: 30,
        }
    }
}

/// Retry budget of the verification gate.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct VerificationParams {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for VerificationParams {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            request_timeout_secs: 10,
        }
    }
}

/// Embedding client parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct EmbeddingParams {
    pub dimension: usize,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Tick of the lazy keyword-embedding backfill job (seconds).
    pub backfill_interval_secs: u64,
}

impl Default for EmbeddingParams {
    fn default() -> Self {
        Self {
            dimension: 1024,
            connect_timeout_secs: 4,
            request_timeout_secs: 10,
            backfill_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub thresholds: Thresholds,
    pub lexical: LexicalParams,
    pub scheduler: SchedulerParams,
    pub verification: VerificationParams,
    pub embedding: EmbeddingParams,
}

impl MatchingConfig {
    /// Parse from a TOML string. Missing sections fall back to defaults.
    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let mut cfg: MatchingConfig = toml::from_str(toml_str)?;
        cfg.harden();
        Ok(cfg)
    }

    /// Load from `MATCHING_CONFIG_PATH` (or the default path), then apply
    /// env threshold overrides. An explicitly configured path must exist; a
    /// missing default file just means defaults.
    pub fn load() -> anyhow::Result<Self> {
        let (path, explicit) = match std::env::var(ENV_MATCHING_CONFIG_PATH) {
            Ok(p) => (PathBuf::from(p), true),
            Err(_) => (PathBuf::from(DEFAULT_MATCHING_CONFIG_PATH), false),
        };

        let mut cfg = match fs::read_to_string(&path) {
            Ok(content) => Self::from_toml_str(&content)?,
            Err(e) if explicit => {
                anyhow::bail!("failed to read matching config at {}: {}", path.display(), e)
            }
            Err(_) => {
                warn!(path = %path.display(), "matching config not found, using defaults");
                MatchingConfig::default()
            }
        };

        if let Some(t) = parse_threshold_env(std::env::var(ENV_LEXICAL_THRESHOLD).ok()) {
            cfg.thresholds.lexical = t;
        }
        if let Some(t) = parse_threshold_env(std::env::var(ENV_SEMANTIC_THRESHOLD).ok()) {
            cfg.thresholds.semantic = t;
        }
        if let Some(t) = parse_threshold_env(std::env::var(ENV_CONFIDENCE_THRESHOLD).ok()) {
            cfg.thresholds.confidence = t;
        }

        Ok(cfg)
    }

    /// Ensure sane values even if the TOML is odd.
    fn harden(&mut self) {
        let d = Thresholds::default();
        if !self.thresholds.lexical.is_finite() {
            self.thresholds.lexical = d.lexical;
        }
        if !self.thresholds.semantic.is_finite() {
            self.thresholds.semantic = d.semantic;
        }
        if !self.thresholds.confidence.is_finite() {
            self.thresholds.confidence = d.confidence;
        }
        self.thresholds.lexical = self.thresholds.lexical.clamp(0.0, 1.0);
        self.thresholds.semantic = self.thresholds.semantic.clamp(0.0, 1.0);
        self.thresholds.confidence = self.thresholds.confidence.clamp(0.0, 1.0);
        if self.lexical.ngram_size == 0 {
            self.lexical.ngram_size = LexicalParams::default().ngram_size;
        }
        if self.lexical.shingle_size == 0 {
            self.lexical.shingle_size = LexicalParams::default().shingle_size;
        }
        if self.verification.max_attempts == 0 {
            self.verification.max_attempts = 1;
        }
    }
}
