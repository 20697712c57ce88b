use thiserror::Error;

/// Failures surfaced by the optimization pipeline.
///
/// Everything except [`PipelineError::RateLimited`] is fatal: it propagates to
/// the run controller untouched and the process exits non-zero, leaving the
/// last persisted checkpoint as the resume point.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{tool} failed (exit code {code:?}): {detail}")]
    ExternalToolFailure {
        tool: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("unexpected engine output: {0}")]
    ParseFailure(String),

    #[error("{tool} was rate limited")]
    RateLimited { tool: String },

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, PipelineError::RateLimited { .. })
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
