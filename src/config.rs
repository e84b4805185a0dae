use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use spec_mapper_core::agent::AgentConfig;
use spec_mapper_core::aggregate::AggregateConfig;
use spec_mapper_core::retry::RetryPolicy;
use spec_mapper_core::search::RetrievalParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Network providers need an explicit model and dimensionality.
    fn requires_model(&self) -> bool {
        matches!(self.provider.as_str(), "openai" | "ollama")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_structural_weight")]
    pub structural_weight: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            score_threshold: default_score_threshold(),
            semantic_weight: default_semantic_weight(),
            structural_weight: default_structural_weight(),
            candidate_k: default_candidate_k(),
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_score_threshold() -> f64 {
    0.15
}
fn default_semantic_weight() -> f64 {
    1.0
}
fn default_structural_weight() -> f64 {
    0.15
}
fn default_candidate_k() -> usize {
    20
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            semantic_weight: self.semantic_weight,
            structural_weight: self.structural_weight,
            candidate_k: self.candidate_k,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MappingConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,
    #[serde(default = "default_minimal_floor")]
    pub minimal_floor: f64,
    #[serde(default = "default_exhausted_penalty")]
    pub exhausted_penalty: f64,
    #[serde(default = "default_fallback_confidence")]
    pub fallback_confidence: f64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_infra_failures")]
    pub max_consecutive_infra_failures: u32,
    /// Wall-clock budget for a whole `map` run.
    #[serde(default)]
    pub budget_secs: Option<u64>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            convergence_threshold: default_convergence_threshold(),
            minimal_floor: default_minimal_floor(),
            exhausted_penalty: default_exhausted_penalty(),
            fallback_confidence: default_fallback_confidence(),
            max_concurrency: default_max_concurrency(),
            max_consecutive_infra_failures: default_max_infra_failures(),
            budget_secs: None,
        }
    }
}

fn default_max_iterations() -> u32 {
    5
}
fn default_convergence_threshold() -> f64 {
    0.7
}
fn default_minimal_floor() -> f64 {
    0.3
}
fn default_exhausted_penalty() -> f64 {
    0.9
}
fn default_fallback_confidence() -> f64 {
    0.5
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_infra_failures() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    8000
}
fn default_call_timeout_secs() -> u64 {
    30
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidatorConfig {
    /// `spec` checks candidates against the document, `http` calls a live API.
    #[serde(default = "default_validator_mode")]
    pub mode: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Extra request headers, e.g. authorization for a sandbox tenant.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_validator_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            mode: default_validator_mode(),
            base_url: None,
            headers: BTreeMap::new(),
            timeout_secs: default_validator_timeout_secs(),
        }
    }
}

fn default_validator_mode() -> String {
    "spec".to_string()
}
fn default_validator_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_iterations: self.mapping.max_iterations,
            convergence_threshold: self.mapping.convergence_threshold,
            exhausted_penalty: self.mapping.exhausted_penalty,
            k: self.retrieval.k,
            score_threshold: self.retrieval.score_threshold,
            max_consecutive_infra_failures: self.mapping.max_consecutive_infra_failures,
        }
    }

    /// `budget_override` (from the command line) wins over `mapping.budget_secs`.
    pub fn aggregate_config(&self, budget_override: Option<u64>) -> AggregateConfig {
        AggregateConfig {
            max_concurrency: self.mapping.max_concurrency,
            minimal_floor: self.mapping.minimal_floor,
            fallback_confidence: self.mapping.fallback_confidence,
            budget: budget_override
                .or(self.mapping.budget_secs)
                .map(Duration::from_secs),
        }
    }
}

fn check_unit(key: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be in [0.0, 1.0], got {}", key, value);
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate retrieval
    if config.retrieval.k < 1 {
        bail!("retrieval.k must be >= 1");
    }
    if config.retrieval.candidate_k < 1 {
        bail!("retrieval.candidate_k must be >= 1");
    }
    check_unit("retrieval.score_threshold", config.retrieval.score_threshold)?;
    if config.retrieval.semantic_weight < 0.0 || config.retrieval.structural_weight < 0.0 {
        bail!("retrieval weights must be >= 0");
    }

    // Validate mapping
    if config.mapping.max_iterations < 1 {
        bail!("mapping.max_iterations must be >= 1");
    }
    if config.mapping.max_concurrency < 1 {
        bail!("mapping.max_concurrency must be >= 1");
    }
    if config.mapping.max_consecutive_infra_failures < 1 {
        bail!("mapping.max_consecutive_infra_failures must be >= 1");
    }
    check_unit("mapping.convergence_threshold", config.mapping.convergence_threshold)?;
    check_unit("mapping.minimal_floor", config.mapping.minimal_floor)?;
    check_unit("mapping.exhausted_penalty", config.mapping.exhausted_penalty)?;
    check_unit("mapping.fallback_confidence", config.mapping.fallback_confidence)?;

    // Validate retry
    if config.retry.call_timeout_secs == 0 {
        bail!("retry.call_timeout_secs must be > 0");
    }
    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        bail!("retry.max_delay_ms must be >= retry.base_delay_ms");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hashing" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.requires_model() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Validate validator
    match config.validator.mode.as_str() {
        "spec" => {}
        "http" => {
            if config.validator.base_url.is_none() {
                bail!("validator.base_url must be set when validator.mode is 'http'");
            }
        }
        other => bail!(
            "Unknown validator mode: '{}'. Must be spec or http.",
            other
        ),
    }

    Ok(())
}
