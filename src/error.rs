//! Error types for the hivemind orchestration core.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HivemindError {
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Event error: {0}")]
    EventError(String),
    #[error("Orchestration error: {0}")]
    OrchestrationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Workflow error: {0}")]
    WorkflowError(String),
}

impl From<serde_json::Error> for HivemindError {
    fn from(error: serde_json::Error) -> Self {
        HivemindError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

pub type Result<T> = std::result::Result<T, HivemindError>;
