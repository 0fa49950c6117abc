//! Typed error hierarchy for propyield.
//!
//! One enum per external seam plus the analysis and chat orchestrators:
//! - `ValidationError`: rejected user input (addresses, emails, names)
//! - `GeocodeError`: mapping provider failures
//! - `LlmError`: language model provider failures
//! - `AnalysisError`: property analysis pipeline failures
//! - `ChatError`: assistant orchestration failures

use thiserror::Error;

/// Input rejected before any service call is made.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Empty { field: &'static str },

    #[error("{field} must be between {min} and {max} characters")]
    Length {
        field: &'static str,
        min: usize,
        max: usize,
    },

    #[error("{field} is not valid: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Errors from the geocoding provider.
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("No location found for address '{address}'")]
    NotFound { address: String },

    #[error("Geocoding quota exceeded")]
    QuotaExceeded,

    #[error("Geocoding API returned status {status}: {message}")]
    Api { status: String, message: String },

    #[error("Geocoding request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Errors from the language model provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Language model quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Language model rejected the API key")]
    Unauthorized,

    #[error("Language model returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Language model returned an empty completion")]
    EmptyCompletion,

    #[error("Language model request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

impl LlmError {
    pub fn is_quota(&self) -> bool {
        matches!(self, LlmError::QuotaExceeded(_))
    }
}

/// Errors from the property analysis pipeline.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Geocode(#[from] GeocodeError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Could not parse analysis response: {0}")]
    InvalidResponse(String),
}

/// Errors from the chat orchestrator.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Chat thread {id} not found")]
    ThreadNotFound { id: i64 },

    #[error("Assistant run {run_id} ended with status '{status}'")]
    RunEnded { run_id: String, status: String },

    #[error("Assistant run {run_id} did not finish after {polls} polls")]
    RunTimedOut { run_id: String, polls: u32 },

    #[error("Assistant API error: {0}")]
    Api(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
