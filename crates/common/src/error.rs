//! Unified error type for spendscope.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("GCP API error (status={status}): {message}")]
    GcpApi { status: u16, message: String },

    #[error("BigQuery error: {0}")]
    Query(String),

    #[error("{producer} timed out after {after_ms}ms")]
    ProducerTimeout { producer: String, after_ms: u64 },

    #[error("{producer} failed: {message}")]
    ProducerFailure { producer: String, message: String },

    #[error("Unknown audit kind: {0}")]
    UnknownAuditKind(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors caused by the configuration rather than a data source.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigurationInvalid(_))
    }
}
