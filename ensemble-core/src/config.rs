//! Engine configuration and the sources it is read from.
//!
//! Every knob the engine consumes lives in [`EngineConfig`]. Components never
//! cache it: they ask a [`ConfigSource`] for a fresh snapshot at the start of
//! each envelope build or retrieval call and use that one snapshot throughout.

use crate::context::TokenBudget;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub temporal_decay: TemporalDecayConfig,
    pub conditional_rules: Vec<ConditionalRule>,
    pub memory_caps: MemoryCaps,
    pub memory_store: MemoryStoreConfig,
    pub vectorization: VectorizationConfig,
    pub token_budget: TokenBudget,
    /// Model routing keyed by `default`, `director`, `world`, `character`
    /// or `character:{name}`.
    pub agents: BTreeMap<String, AgentProfile>,
    pub orchestration: OrchestrationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            temporal_decay: TemporalDecayConfig::default(),
            conditional_rules: Vec::new(),
            memory_caps: MemoryCaps::default(),
            memory_store: MemoryStoreConfig::default(),
            vectorization: VectorizationConfig::default(),
            token_budget: TokenBudget::default(),
            agents: BTreeMap::new(),
            orchestration: OrchestrationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the algorithms cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let decay = &self.temporal_decay;
        if decay.enabled && decay.half_life <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "temporalDecay.halfLife must be positive, got {}",
                decay.half_life
            )));
        }
        if !(0.0..=1.0).contains(&decay.floor) {
            return Err(ConfigError::Invalid(format!(
                "temporalDecay.floor must be within [0, 1], got {}",
                decay.floor
            )));
        }
        if let Some((section, fraction)) = self
            .token_budget
            .allocations
            .iter()
            .find(|(_, f)| **f < 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "tokenBudget.allocations.{} is negative ({fraction})",
                section.key()
            )));
        }
        if self.token_budget.chars_per_token <= 0.0 {
            return Err(ConfigError::Invalid(
                "tokenBudget.charsPerToken must be positive".to_string(),
            ));
        }
        if self.vectorization.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "vectorization.chunkSize must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.vectorization.sliding_window_overlap) {
            return Err(ConfigError::Invalid(
                "vectorization.slidingWindowOverlap must be within [0, 1)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_temporal_decay(mut self, decay: TemporalDecayConfig) -> Self {
        self.temporal_decay = decay;
        self
    }

    pub fn with_rule(mut self, rule: ConditionalRule) -> Self {
        self.conditional_rules.push(rule);
        self
    }

    pub fn with_memory_caps(mut self, caps: MemoryCaps) -> Self {
        self.memory_caps = caps;
        self
    }

    pub fn with_token_budget(mut self, budget: TokenBudget) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn with_vectorization(mut self, vectorization: VectorizationConfig) -> Self {
        self.vectorization = vectorization;
        self
    }

    pub fn with_agent_profile(mut self, key: impl Into<String>, profile: AgentProfile) -> Self {
        self.agents.insert(key.into(), profile);
        self
    }

    pub fn with_orchestration(mut self, orchestration: OrchestrationConfig) -> Self {
        self.orchestration = orchestration;
        self
    }
}

/// How memory age is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecayMode {
    /// Wall-clock hours since the memory was stored.
    Time,
    /// Messages logged in the originating scene since the memory was stored.
    MessageCount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemporalDecayConfig {
    pub enabled: bool,
    pub mode: DecayMode,
    /// Age at which the score is halved (hours or messages, per `mode`).
    pub half_life: f64,
    /// Lower bound of the decay factor.
    pub floor: f64,
}

impl Default for TemporalDecayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: DecayMode::Time,
            half_life: 168.0,
            floor: 0.25,
        }
    }
}

impl TemporalDecayConfig {
    pub fn time(half_life_hours: f64, floor: f64) -> Self {
        Self {
            enabled: true,
            mode: DecayMode::Time,
            half_life: half_life_hours,
            floor,
        }
    }

    pub fn message_count(half_life_messages: f64, floor: f64) -> Self {
        Self {
            enabled: true,
            mode: DecayMode::MessageCount,
            half_life: half_life_messages,
            floor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    #[default]
    Substring,
    Exact,
}

/// Multiply a memory's score when a metadata field matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalRule {
    /// Dot path into the memory metadata, e.g. `characterName` or `extra.tags`.
    pub field: String,
    #[serde(rename = "match")]
    pub pattern: String,
    pub boost: f32,
    #[serde(default)]
    pub match_type: MatchType,
}

impl ConditionalRule {
    pub fn substring(field: impl Into<String>, pattern: impl Into<String>, boost: f32) -> Self {
        Self {
            field: field.into(),
            pattern: pattern.into(),
            boost,
            match_type: MatchType::Substring,
        }
    }

    pub fn exact(field: impl Into<String>, pattern: impl Into<String>, boost: f32) -> Self {
        Self {
            match_type: MatchType::Exact,
            ..Self::substring(field, pattern, boost)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryCaps {
    pub max_top_k: usize,
    pub max_query_chars: usize,
}

impl Default for MemoryCaps {
    fn default() -> Self {
        Self {
            max_top_k: 50,
            max_query_chars: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryStoreConfig {
    /// Results below this cosine similarity are discarded.
    pub min_similarity: f32,
    /// Filtered deletions larger than this need `confirm`.
    pub bulk_delete_threshold: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.0,
            bulk_delete_threshold: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChunkStrategy {
    PerRound,
    PerMessage,
    PerScene,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VectorizationConfig {
    pub enabled: bool,
    pub chunk_strategy: ChunkStrategy,
    /// Target chunk length in characters for summary chunking.
    pub chunk_size: usize,
    /// Fraction of `chunk_size` carried over from the previous chunk.
    pub sliding_window_overlap: f64,
    /// Transcript lines are cut to this many characters.
    pub max_line_chars: usize,
}

impl Default for VectorizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_strategy: ChunkStrategy::PerRound,
            chunk_size: 1000,
            sliding_window_overlap: 0.0,
            max_line_chars: 400,
        }
    }
}

/// Model routing for one agent key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentProfile {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    /// JSON validation retries after the first attempt.
    pub max_retries: Option<u32>,
}

impl AgentProfile {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Fill every unset field from `fallback`.
    pub fn or(self, fallback: &AgentProfile) -> AgentProfile {
        AgentProfile {
            model: self.model.or_else(|| fallback.model.clone()),
            temperature: self.temperature.or(fallback.temperature),
            max_tokens: self.max_tokens.or(fallback.max_tokens),
            max_retries: self.max_retries.or(fallback.max_retries),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestrationConfig {
    /// Run the World step between Director and Characters.
    pub world_pass: bool,
    /// Run a second Director pass after all Characters.
    pub reconciliation: bool,
    /// Memories requested per participant when building context.
    pub memory_top_k: usize,
    /// Most recent scene messages fed to the context builder.
    pub history_limit: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            world_pass: true,
            reconciliation: false,
            memory_top_k: 8,
            history_limit: 60,
        }
    }
}

/// Supplies configuration snapshots.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn snapshot(&self) -> EngineConfig;
}

/// A fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(EngineConfig);

impl StaticConfig {
    pub fn new(config: EngineConfig) -> Self {
        Self(config)
    }
}

#[async_trait]
impl ConfigSource for StaticConfig {
    async fn snapshot(&self) -> EngineConfig {
        self.0.clone()
    }
}

/// Re-reads a JSON file on every snapshot so edits apply to the next call.
#[derive(Debug, Clone)]
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfig {
    async fn snapshot(&self) -> EngineConfig {
        match EngineConfig::load(&self.path).await {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Falling back to default config");
                EngineConfig::default()
            }
        }
    }
}
