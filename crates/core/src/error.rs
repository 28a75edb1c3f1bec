//! Error types for the Taskloom domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Each bounded context
//! has its own error enum; the top-level `Error` collects them.
//!
//! The taxonomy encodes recoverability:
//! - `Config` is fatal — the run aborts immediately with a diagnostic.
//! - `Tool` errors are recoverable — the dispatcher converts them into
//!   failed outcomes the model observes; they never abort a turn.
//! - `Provider` errors are retryable when transient (rate limit, timeout,
//!   network, 5xx) and terminal otherwise.
//! - `Plan` errors are retryable through bounded re-planning.
//! - Cancellation is *not* an error: a stopped turn reports a terminal
//!   `Stopped` status with whatever transcript exists.

use thiserror::Error;

/// The top-level error type for all Taskloom operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Planning errors ---
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Persistence ---
    #[error("Store error: {0}")]
    Store(String),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Malformed completion: {0}")]
    MalformedResponse(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether a retry with backoff is worth attempting.
    ///
    /// Rate limits, timeouts, network failures, and 5xx responses are
    /// transient; everything else fails the turn immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) => true,
            Self::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Confirmation denied: {tool_name} — {reason}")]
    ConfirmationDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Clone, Error)]
pub enum PlanError {
    #[error("Plan generation failed: {0}")]
    GenerationFailed(String),

    #[error("Plan response was not parseable: {0}")]
    Unparseable(String),

    #[error("Re-plan budget exhausted after {replans} re-plans (failed step: {failed_step})")]
    ReplanBudgetExhausted { replans: u32, failed_step: String },
}
