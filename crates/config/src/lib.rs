//! Configuration loading, validation, and budget presets for Opsdesk.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`OPSDESK_PROVIDER`, `OPSDESK_MODEL`). Validates all settings at load
//! time. Budget presets are immutable per agent kind: the top-level chat
//! agent gets the large-context preset with background summarization; the
//! specialized sub-agents run on a smaller context without it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The kind of agent a turn runs under. Each kind maps to a budget preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// The staff-facing chat agent (orchestrates the others).
    Chat,
    /// Web research sub-agent.
    Web,
    /// Document generation sub-agent.
    Document,
    /// CRM sub-agent.
    Crm,
    /// Third-party integration sub-agent.
    Integration,
    /// Workflow execution sub-agent.
    Workflow,
}

/// Token budget configuration for one agent kind.
///
/// Immutable per agent type; constructed from a preset and never mutated
/// during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Total context window of the underlying model.
    #[serde(default = "default_context_limit")]
    pub model_context_limit: usize,

    /// Fraction of the window the engine is allowed to fill (e.g. 0.75).
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f32,

    /// Tokens reserved for the fixed system instructions.
    #[serde(default = "default_system_instruction_tokens")]
    pub system_instruction_tokens: usize,

    /// Tokens reserved for the model's output.
    #[serde(default = "default_output_reserve")]
    pub output_reserve_tokens: usize,

    /// The most recent N history messages are never filtered out.
    #[serde(default = "default_min_protected")]
    pub min_protected_recent: usize,

    /// Usage ratio at which background summarization is scheduled.
    #[serde(default = "default_summarization_threshold")]
    pub summarization_threshold: f32,

    /// Whether background summarization runs for this agent kind.
    #[serde(default = "default_true")]
    pub summarization_enabled: bool,
}

fn default_context_limit() -> usize {
    200_000
}
fn default_safety_margin() -> f32 {
    0.75
}
fn default_system_instruction_tokens() -> usize {
    2_000
}
fn default_output_reserve() -> usize {
    8_000
}
fn default_min_protected() -> usize {
    4
}
fn default_summarization_threshold() -> f32 {
    0.65
}
fn default_true() -> bool {
    true
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self::chat()
    }
}

impl BudgetConfig {
    /// Preset for the staff-facing chat agent: large window, summarization on.
    pub fn chat() -> Self {
        Self {
            model_context_limit: default_context_limit(),
            safety_margin: default_safety_margin(),
            system_instruction_tokens: default_system_instruction_tokens(),
            output_reserve_tokens: default_output_reserve(),
            min_protected_recent: default_min_protected(),
            summarization_threshold: default_summarization_threshold(),
            summarization_enabled: true,
        }
    }

    /// Preset for specialized sub-agents: smaller window, no summarization.
    pub fn sub_agent() -> Self {
        Self {
            model_context_limit: 50_000,
            safety_margin: 0.70,
            system_instruction_tokens: 1_000,
            output_reserve_tokens: 4_000,
            min_protected_recent: 2,
            summarization_threshold: default_summarization_threshold(),
            summarization_enabled: false,
        }
    }

    /// The preset for a given agent kind.
    pub fn for_agent(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Chat => Self::chat(),
            AgentKind::Web
            | AgentKind::Document
            | AgentKind::Crm
            | AgentKind::Integration
            | AgentKind::Workflow => Self::sub_agent(),
        }
    }

    /// The token allowance for injected context after all reservations.
    ///
    /// `limit * margin - system_instructions - output_reserve`, floored at 0.
    pub fn context_budget(&self) -> usize {
        let usable = (self.model_context_limit as f32 * self.safety_margin) as usize;
        usable
            .saturating_sub(self.system_instruction_tokens)
            .saturating_sub(self.output_reserve_tokens)
    }

    /// Validate margin and limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_context_limit == 0 {
            return Err(ConfigError::ValidationError(
                "model_context_limit must be > 0".into(),
            ));
        }
        if self.safety_margin <= 0.0 || self.safety_margin > 1.0 {
            return Err(ConfigError::ValidationError(
                "safety_margin must be in (0, 1]".into(),
            ));
        }
        if self.summarization_threshold <= 0.0 || self.summarization_threshold > 1.0 {
            return Err(ConfigError::ValidationError(
                "summarization_threshold must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// The root configuration structure, mapped from `opsdesk.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Budget preset for the chat agent
    #[serde(default = "BudgetConfig::chat")]
    pub chat_budget: BudgetConfig,

    /// Budget preset for sub-agents
    #[serde(default = "BudgetConfig::sub_agent")]
    pub sub_agent_budget: BudgetConfig,
}

fn default_provider() -> String {
    "anthropic".into()
}

fn default_model() -> String {
    "claude-sonnet-4".into()
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            chat_budget: BudgetConfig::chat(),
            sub_agent_budget: BudgetConfig::sub_agent(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a file path with environment overrides.
    ///
    /// - `OPSDESK_PROVIDER` overrides `default_provider`
    /// - `OPSDESK_MODEL` overrides `default_model`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;

        if let Ok(provider) = std::env::var("OPSDESK_PROVIDER") {
            config.default_provider = provider;
        }
        if let Ok(model) = std::env::var("OPSDESK_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }
        self.chat_budget.validate()?;
        self.sub_agent_budget.validate()?;
        Ok(())
    }

    /// The budget preset for a given agent kind, from this config.
    pub fn budget_for(&self, kind: AgentKind) -> &BudgetConfig {
        match kind {
            AgentKind::Chat => &self.chat_budget,
            _ => &self.sub_agent_budget,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
