//! Error types for replay runs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    /// Missing spec path, database environment, composition limits, eval opt-in.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Spec parse error: {path}: {reason}")]
    SpecParse { path: String, reason: String },

    /// Missing required step field, unknown or unimplemented op.
    #[error("Invalid spec: {0}")]
    SpecValidation(String),

    /// Status/JSON mismatch, unmatched must-rule, DB predicate, console error.
    #[error("{0}")]
    Assertion(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReplayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReplayError::Timeout(_))
    }

    /// Short category name, used in logs and the stderr summary.
    pub fn category(&self) -> &'static str {
        match self {
            ReplayError::Config(_) => "configuration",
            ReplayError::SpecParse { .. } | ReplayError::SpecValidation(_) => "spec-validation",
            ReplayError::Assertion(_) => "assertion",
            ReplayError::Browser(_)
            | ReplayError::Timeout(_)
            | ReplayError::Database(_)
            | ReplayError::Io(_)
            | ReplayError::Json(_) => "infrastructure",
        }
    }
}

impl From<mysql_async::Error> for ReplayError {
    fn from(e: mysql_async::Error) -> Self {
        ReplayError::Database(e.to_string())
    }
}

pub type ReplayResult<T> = Result<T, ReplayError>;
