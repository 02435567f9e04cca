use thiserror::Error;

pub use crate::anthropic::AnthropicError;

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown control action: {0}")]
    InvalidAction(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Suggestion failed: {0}")]
    Suggestion(String),

    #[error("Strategy analysis failed: {0}")]
    Analysis(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Classifies a failure inside a job run for narration and propagation.
///
/// Only [`FailureKind::Fatal`] terminates a job; every other kind is isolated
/// to the iteration it happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Baseline evaluation failed; the job ends as `failed`.
    Fatal,
    /// An optimization-round evaluation failed; the round is skipped.
    Recoverable,
    /// The suggester produced no usable parameters; the round is skipped.
    EmptySuggestion,
    /// Releasing evaluator-side caches failed; logged only.
    Cleanup,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Fatal => write!(f, "Fatal"),
            FailureKind::Recoverable => write!(f, "Recoverable"),
            FailureKind::EmptySuggestion => write!(f, "EmptySuggestion"),
            FailureKind::Cleanup => write!(f, "Cleanup"),
        }
    }
}
