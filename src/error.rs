//! Error types for Herdr
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in Herdr
#[derive(Debug, Error)]
pub enum HerdrError {
    /// Message bus operation failed (unknown project, bad participant)
    #[error("Bus error: {0}")]
    Bus(String),

    /// Task group bookkeeping error
    #[error("Group error: {0}")]
    Group(String),

    /// Configuration could not be used
    #[error("Config error: {0}")]
    Config(String),

    /// Filesystem watch could not be established
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Atomic replace of a temp file failed
    #[error("Persist error: {0}")]
    Persist(#[from] tempfile::PersistError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for Herdr operations
pub type Result<T> = std::result::Result<T, HerdrError>;
