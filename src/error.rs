use thiserror::Error;

use crate::config::TestStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("test not found: {0}")]
    TestNotFound(String),

    #[error("variant not found: {0}")]
    VariantNotFound(String),

    #[error("assignment not found: {0}")]
    AssignmentNotFound(String),

    #[error("test already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid transition: cannot {action} while test is {status:?}")]
    InvalidTransition {
        action: &'static str,
        status: TestStatus,
    },

    #[error("missing required input: {0}")]
    MissingInput(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
