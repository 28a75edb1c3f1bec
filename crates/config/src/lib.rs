//! Configuration loading and validation for Taskloom.
//!
//! Loads settings from a TOML file with environment variable overrides,
//! and validates every budget and threshold at startup. An impossible
//! configuration (zone budgets exceeding the context window, zero
//! iterations) is a fatal error before any turn runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root settings structure. Maps directly to `taskloom.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Model identifier passed to the completion provider
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature for the main loop
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Context zone budgets
    #[serde(default)]
    pub context: ContextSettings,

    /// Iteration limits
    #[serde(default)]
    pub limits: LimitSettings,

    /// Tool dispatch settings
    #[serde(default)]
    pub tools: ToolSettings,

    /// Loop/deviation detector thresholds
    #[serde(default)]
    pub detector: DetectorSettings,

    /// Plan-execute settings
    #[serde(default)]
    pub plan: PlanSettings,

    /// Completion retry policy
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_model() -> String {
    "claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}

/// Token budgets for the six context zones.
///
/// System and Environment are unbudgeted (never truncated); the three
/// injected zones carry hard caps; History gets whatever remains and is
/// compressed when it overflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Total model context window in tokens
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Tokens reserved for the model's output
    #[serde(default = "default_reserved_output")]
    pub reserved_output_tokens: usize,

    /// Cap for routed skill guidance
    #[serde(default = "default_skill_budget")]
    pub skill_budget: usize,

    /// Cap for retrieved knowledge snippets
    #[serde(default = "default_knowledge_budget")]
    pub knowledge_budget: usize,

    /// Cap for recalled long-term memory
    #[serde(default = "default_memory_budget")]
    pub memory_budget: usize,

    /// Most-recent messages always kept verbatim, never compressed
    #[serde(default = "default_history_floor")]
    pub history_floor: usize,

    /// How many snippets to request from each retriever per turn
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
}

fn default_context_window() -> usize {
    8192
}
fn default_reserved_output() -> usize {
    1024
}
fn default_skill_budget() -> usize {
    800
}
fn default_knowledge_budget() -> usize {
    1200
}
fn default_memory_budget() -> usize {
    800
}
fn default_history_floor() -> usize {
    4
}
fn default_retrieval_top_k() -> usize {
    4
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            reserved_output_tokens: default_reserved_output(),
            skill_budget: default_skill_budget(),
            knowledge_budget: default_knowledge_budget(),
            memory_budget: default_memory_budget(),
            history_floor: default_history_floor(),
            retrieval_top_k: default_retrieval_top_k(),
        }
    }
}

impl ContextSettings {
    /// Tokens available for input after reserving output space.
    pub fn input_budget(&self) -> usize {
        self.context_window.saturating_sub(self.reserved_output_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Maximum think-act-observe iterations per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Per-step iteration cap in plan-execute mode
    #[serde(default = "default_step_max_iterations")]
    pub step_max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_step_max_iterations() -> u32 {
    10
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            step_max_iterations: default_step_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Maximum tool invocations in flight within one batch
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Fallback execution timeout when a tool declares none
    #[serde(default = "default_tool_timeout")]
    pub default_timeout_secs: u64,

    /// How long to wait for a human confirmation decision
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,

    /// Maximum characters of tool output kept after head/tail shaping
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_max_concurrency() -> usize {
    5
}
fn default_tool_timeout() -> u64 {
    60
}
fn default_confirmation_timeout() -> u64 {
    120
}
fn default_max_output_chars() -> usize {
    3000
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_timeout_secs: default_tool_timeout(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSettings {
    /// Consecutive identical calls before a corrective note
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: u32,

    /// Consecutive identical calls that force-terminate the turn
    #[serde(default = "default_repeat_ceiling")]
    pub repeat_ceiling: u32,

    /// Sliding window of remembered fingerprints
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Consecutive empty results from one tool before a note
    #[serde(default = "default_empty_result_threshold")]
    pub empty_result_threshold: u32,

    /// Consecutive off-plan tool calls before a drift note
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: u32,

    /// Run the advisory goal-overlap check every N iterations
    #[serde(default = "default_drift_check_interval")]
    pub drift_check_interval: u32,
}

fn default_repeat_threshold() -> u32 {
    3
}
fn default_repeat_ceiling() -> u32 {
    6
}
fn default_window_size() -> usize {
    10
}
fn default_empty_result_threshold() -> u32 {
    3
}
fn default_drift_threshold() -> u32 {
    2
}
fn default_drift_check_interval() -> u32 {
    5
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            repeat_threshold: default_repeat_threshold(),
            repeat_ceiling: default_repeat_ceiling(),
            window_size: default_window_size(),
            empty_result_threshold: default_empty_result_threshold(),
            drift_threshold: default_drift_threshold(),
            drift_check_interval: default_drift_check_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSettings {
    /// Re-plans allowed before the run fails terminally
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,

    /// Plans shorter than this run as a single reactive turn instead
    #[serde(default = "default_min_plan_steps")]
    pub min_plan_steps: usize,

    /// Temperature for plan generation (lower = more deterministic)
    #[serde(default = "default_planner_temperature")]
    pub planner_temperature: f32,
}

fn default_max_replans() -> u32 {
    2
}
fn default_min_plan_steps() -> usize {
    3
}
fn default_planner_temperature() -> f32 {
    0.3
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            max_replans: default_max_replans(),
            min_plan_steps: default_min_plan_steps(),
            planner_temperature: default_planner_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts per completion request (1 = no retry)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles per attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

impl Settings {
    /// Load settings from `taskloom.toml` in the current directory, with
    /// environment variable overrides:
    /// - `TASKLOOM_MODEL` overrides the model
    /// - `TASKLOOM_MAX_ITERATIONS` overrides the per-turn iteration cap
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = Self::load_from(Path::new("taskloom.toml"))?;

        if let Ok(model) = std::env::var("TASKLOOM_MODEL") {
            settings.model = model;
        }
        if let Ok(raw) = std::env::var("TASKLOOM_MAX_ITERATIONS") {
            settings.limits.max_iterations = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "TASKLOOM_MAX_ITERATIONS must be a positive integer, got {raw:?}"
                ))
            })?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let settings: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate budgets and thresholds. Fails on configurations that make
    /// assembly or looping impossible rather than surprising at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.temperature < 0.0 || self.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let ctx = &self.context;
        if ctx.reserved_output_tokens >= ctx.context_window {
            return Err(ConfigError::ValidationError(format!(
                "reserved_output_tokens ({}) must be smaller than context_window ({})",
                ctx.reserved_output_tokens, ctx.context_window
            )));
        }
        let injected = ctx.skill_budget + ctx.knowledge_budget + ctx.memory_budget;
        if injected > ctx.input_budget() {
            return Err(ConfigError::ValidationError(format!(
                "zone budgets ({injected}) exceed the input budget ({})",
                ctx.input_budget()
            )));
        }
        if ctx.history_floor == 0 {
            return Err(ConfigError::ValidationError(
                "history_floor must be at least 1".into(),
            ));
        }

        if self.limits.max_iterations == 0 || self.limits.step_max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "iteration limits must be at least 1".into(),
            ));
        }

        if self.tools.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "tools.max_concurrency must be at least 1".into(),
            ));
        }

        let det = &self.detector;
        if det.repeat_threshold < 2 {
            return Err(ConfigError::ValidationError(
                "detector.repeat_threshold must be at least 2".into(),
            ));
        }
        if det.repeat_ceiling < det.repeat_threshold {
            return Err(ConfigError::ValidationError(format!(
                "detector.repeat_ceiling ({}) must be >= repeat_threshold ({})",
                det.repeat_ceiling, det.repeat_threshold
            )));
        }
        if det.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "detector.window_size must be at least 1".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context: ContextSettings::default(),
            limits: LimitSettings::default(),
            tools: ToolSettings::default(),
            detector: DetectorSettings::default(),
            plan: PlanSettings::default(),
            retry: RetrySettings::default(),
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

impl From<ConfigError> for taskloom_core::Error {
    fn from(err: ConfigError) -> Self {
        taskloom_core::Error::Config {
            message: err.to_string(),
        }
    }
}
