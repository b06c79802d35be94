//! Error types for the analytics resolution engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// What went wrong on the way to the live source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Network,
    Auth,
    Timeout,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Network => "network",
            TransportKind::Auth => "auth",
            TransportKind::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

#[derive(Error, Debug)]
pub enum AnalyticsError {

    // =============================
    // Driver model & arithmetic
    // =============================

    #[error("Missing driver '{driver}' required by {context}")]
    MissingDriver { driver: String, context: String },

    #[error("Driver tree contains a cycle through node '{node}'")]
    Cycle { node: String },

    #[error("Invalid driver model: {0}")]
    InvalidModel(String),

    #[error("Undefined value: {0}")]
    UndefinedValue(String),

    #[error(
        "Reconciliation failed for {metric}: total variance {total} vs attributed {attributed} (tolerance {tolerance})"
    )]
    Reconciliation {
        metric: String,
        total: f64,
        attributed: f64,
        tolerance: f64,
    },

    // =============================
    // Data resolution
    // =============================

    #[error("Transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("No data available for query {query}")]
    NoData { query: String },

    #[error("Live source rejected query: {0}")]
    QueryRejected(String),

    // =============================
    // Classification
    // =============================

    #[error("Classifier returned out-of-taxonomy label '{label}'")]
    Classification { label: String },

    #[error("LLM error: {0}")]
    LlmError(String),

    // =============================
    // Caller & configuration
    // =============================

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AnalyticsError {
    pub fn missing_driver(driver: impl Into<String>, context: impl Into<String>) -> Self {
        AnalyticsError::MissingDriver {
            driver: driver.into(),
            context: context.into(),
        }
    }

    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        AnalyticsError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Transport failures are the only errors the resolver retries or recovers from.
    pub fn is_transport(&self) -> bool {
        matches!(self, AnalyticsError::Transport { .. })
    }
}
