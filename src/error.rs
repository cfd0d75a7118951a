//! Error types for the agent, its collaborators and the job surface.

use crate::types::JobId;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// No job with this identifier is known to the registry.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// A submit or control request failed validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The browser driver failed or could not be reached.
    #[error("Browser error: {0}")]
    Browser(String),

    /// The reasoning backend failed before producing a reply.
    #[error("Reasoning backend error: {0}")]
    Reasoning(String),

    /// The reasoning backend answered with a non-success status.
    #[error("Reasoning backend returned {status}: {message}")]
    ReasoningStatus { status: u16, message: String },

    /// A structured reply could not be interpreted.
    #[error("Malformed structured output: {0}")]
    MalformedOutput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Wrap a driver-level error, keeping its whole context chain.
    pub fn browser(err: impl std::fmt::Display) -> Self {
        AgentError::Browser(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
