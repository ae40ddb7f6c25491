//! Whole-system configuration, loadable from one TOML file.
//!
//! Every tunable the pipeline exposes lives here with its default: segmenter
//! geometry, orchestrator cadence, retrieval limits, confidence bands. A
//! missing file or missing section falls back to defaults, so a bare
//! `MnemoConfig::default()` is always a working configuration.

use crate::retrieval::confidence::ConfidenceThresholds;
use crate::retrieval::fusion::DEFAULT_RRF_K;
use crate::retrieval::hybrid::RetrieveOptions;
use crate::retrieval::orchestrator::OrchestratorConfig;
use anyhow::{Context, Result};
use mnemo_dialog::SegmenterConfig;
use mnemo_embed::EmbedConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Orchestrator settings as they appear in the config file (durations in
/// plain integer fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub default_backoff_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let config = OrchestratorConfig::default();
        Self {
            poll_interval_secs: config.poll_interval.as_secs(),
            batch_size: config.batch_size,
            default_backoff_secs: config.default_backoff.as_secs(),
        }
    }
}

impl OrchestratorSettings {
    pub fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_batch_size(self.batch_size)
            .with_default_backoff(Duration::from_secs(self.default_backoff_secs))
    }
}

/// Retrieval settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub max_variants: usize,
    pub per_query_limit: usize,
    pub rerank: bool,
    pub rerank_top_k: usize,
    pub near_duplicate_threshold: f32,
    pub expand_message_hits: bool,
    pub branch_timeout_ms: u64,
    pub rrf_k: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        let options = RetrieveOptions::default();
        Self {
            max_variants: options.max_variants,
            per_query_limit: options.per_query_limit,
            rerank: options.rerank,
            rerank_top_k: 10,
            near_duplicate_threshold: options.near_duplicate_threshold,
            expand_message_hits: options.expand_message_hits,
            branch_timeout_ms: options.branch_timeout.as_millis() as u64,
            rrf_k: DEFAULT_RRF_K,
        }
    }
}

impl RetrievalSettings {
    pub fn to_options(&self) -> RetrieveOptions {
        RetrieveOptions {
            variants: Vec::new(),
            max_variants: self.max_variants,
            per_query_limit: self.per_query_limit,
            rerank: self.rerank,
            near_duplicate_threshold: self.near_duplicate_threshold,
            expand_message_hits: self.expand_message_hits,
            branch_timeout: Duration::from_millis(self.branch_timeout_ms),
        }
    }
}

/// Top-level configuration aggregating every component's section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MnemoConfig {
    pub segmenter: SegmenterConfig,
    pub embedding: EmbedConfig,
    pub orchestrator: OrchestratorSettings,
    pub retrieval: RetrievalSettings,
    pub confidence: ConfidenceThresholds,
}

impl MnemoConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: MnemoConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from a file when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
