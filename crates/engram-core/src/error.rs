use thiserror::Error;

/// Top-level error taxonomy. Subsystem crates carry their own narrower enums;
/// everything is folded into this type at the controller/façade boundary.
#[derive(Debug, Error)]
pub enum EngramError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error ({provider}): {message}")]
    Transport { provider: String, message: String },

    #[error("Unsupported capability: {0}")]
    Unsupported(String),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Memory engine is not enabled")]
    NotEnabled,

    #[error("Memory engine is already enabled")]
    AlreadyEnabled,

    #[error("Wrong mode: operation requires {required} mode, instance is {actual}")]
    WrongMode { required: String, actual: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Deadline exceeded after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngramError {
    /// Short stable code string for logs and diagnostics payloads.
    pub fn code(&self) -> &'static str {
        match self {
            EngramError::Config(_) => "CONFIG_ERROR",
            EngramError::Transport { .. } => "TRANSPORT_ERROR",
            EngramError::Unsupported(_) => "UNSUPPORTED",
            EngramError::SchemaViolation(_) => "SCHEMA_VIOLATION",
            EngramError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngramError::NotEnabled => "NOT_ENABLED",
            EngramError::AlreadyEnabled => "ALREADY_ENABLED",
            EngramError::WrongMode { .. } => "WRONG_MODE",
            EngramError::Storage(_) => "STORAGE_ERROR",
            EngramError::Timeout { .. } => "TIMEOUT",
            EngramError::Serialization(_) => "SERIALIZATION_ERROR",
            EngramError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngramError>;
