use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::RecordStatus;

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Network/timeout-class failure; the operation may succeed if repeated.
    Retryable,
    /// Structural failure; repeating the operation cannot help.
    Fatal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Retryable => write!(f, "retryable"),
            FailureClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Application-wide error types for Gleaner.
#[derive(Error, Debug)]
pub enum AppError {
    /// Fetching a page failed. The fetcher decides whether it is transient.
    #[error("Fetch error: {message}")]
    FetchError { message: String, retryable: bool },

    /// A single attempt ran past its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Fetched content is structurally unusable (not the expected shape).
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// The retry budget for a record ran out.
    #[error("Retries exhausted after {attempts} attempt(s) ({class}): {message}")]
    Exhausted {
        attempts: u32,
        class: FailureClass,
        message: String,
    },

    /// The checkpoint log could not be read or written. Fatal to the run.
    #[error("Checkpoint I/O error: {0}")]
    CheckpointError(String),

    /// Input records could not be loaded.
    #[error("Input error: {0}")]
    InputError(String),

    /// Enriched output could not be written.
    #[error("Output error: {0}")]
    SinkError(String),

    /// Invalid rule set, comparison policy or runtime setting.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A record was asked to move through an illegal status transition.
    #[error("Illegal status transition for '{record_id}': {from} -> {to}")]
    InvalidTransition {
        record_id: String,
        from: RecordStatus,
        to: RecordStatus,
    },

    /// The run was cancelled before the record could finish.
    #[error("cancelled")]
    Cancelled,

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::FetchError { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Classification consumed by the retry controller.
    pub fn class(&self) -> FailureClass {
        if self.is_retryable() {
            FailureClass::Retryable
        } else {
            FailureClass::Fatal
        }
    }

    /// Returns true if this error must abort the whole run rather than a
    /// single record.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            AppError::CheckpointError(_)
                | AppError::InputError(_)
                | AppError::SinkError(_)
                | AppError::ConfigError(_)
                | AppError::InvalidTransition { .. }
        )
    }

    /// Shorthand for a transient fetch failure.
    pub fn retryable_fetch(message: impl Into<String>) -> Self {
        AppError::FetchError {
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a permanent fetch failure (404-class).
    pub fn fatal_fetch(message: impl Into<String>) -> Self {
        AppError::FetchError {
            message: message.into(),
            retryable: false,
        }
    }
}
