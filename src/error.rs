//! GovShield error types
//!
//! Only infrastructure failures travel through [`Error`]. Guardrail blocks and
//! detector findings are business outcomes and are returned as values.

use thiserror::Error;

/// GovShield error type
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing rule configuration. Fatal, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote detector backend timed out or failed
    #[error("Detector unavailable: {0}")]
    DetectorUnavailable(String),

    /// Audit recorder append failed
    #[error("Audit write failure: {0}")]
    AuditWrite(String),

    /// Malformed caller input (timeframe, empty category set, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A cancellable scan was cancelled between category passes
    #[error("Operation cancelled")]
    Cancelled,

    /// Tokenization key or token error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config file parse error
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error aborts the whole call instead of degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::InvalidInput(_))
    }

    /// Stable machine-readable code used by the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIGURATION_ERROR",
            Error::DetectorUnavailable(_) => "DETECTOR_UNAVAILABLE",
            Error::AuditWrite(_) => "AUDIT_WRITE_FAILURE",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Cancelled => "CANCELLED",
            Error::Crypto(_) => "CRYPTO_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for GovShield operations
pub type Result<T> = std::result::Result<T, Error>;
