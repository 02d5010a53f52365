//! Error types for the JovianDSS CSI plugin
//!
//! Controller and node operations fail with [`Error`], whose [`StatusCode`]
//! follows the CSI status conventions orchestration clients expect. Backend
//! failures are classified separately by
//! [`RestError`](crate::backends::error::RestError) and mapped onto these
//! codes at each call site.

use crate::backends::error::{RestError, RestErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CSI-family status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
        }
    }

    /// HTTP status used by the JSON API
    pub fn http_status(&self) -> u16 {
        match self {
            StatusCode::InvalidArgument | StatusCode::OutOfRange => 400,
            StatusCode::NotFound => 404,
            StatusCode::AlreadyExists | StatusCode::Aborted => 409,
            StatusCode::FailedPrecondition => 412,
            StatusCode::Unimplemented => 501,
            StatusCode::Internal => 500,
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified error type for the plugin
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Command {command} failed: {reason}")]
    Command { command: String, reason: String },

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Status code reported to the caller
    pub fn code(&self) -> StatusCode {
        match self {
            Error::InvalidArgument(_) => StatusCode::InvalidArgument,
            Error::NotFound(_) => StatusCode::NotFound,
            Error::AlreadyExists(_) => StatusCode::AlreadyExists,
            Error::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Error::Aborted(_) => StatusCode::Aborted,
            Error::OutOfRange(_) => StatusCode::OutOfRange,
            Error::Unimplemented(_) => StatusCode::Unimplemented,
            Error::Internal(_)
            | Error::Configuration(_)
            | Error::Command { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::Yaml(_)
            | Error::Metrics(_) => StatusCode::Internal,
        }
    }

    /// Map a backend failure of `op` onto a status
    ///
    /// Busy becomes FailedPrecondition, missing becomes NotFound, existing
    /// becomes AlreadyExists, anything else is Internal.
    pub fn from_backend(op: &str, err: &RestError) -> Self {
        let msg = format!("{}: {}", op, err);
        match err.kind {
            RestErrorKind::ResourceBusy => Error::FailedPrecondition(msg),
            RestErrorKind::ResourceDoesNotExist => Error::NotFound(msg),
            RestErrorKind::ObjectExists => Error::AlreadyExists(msg),
            RestErrorKind::Unknown
            | RestErrorKind::RequestMalfunction
            | RestErrorKind::UnableToConnect
            | RestErrorKind::ResponseProcessingMalfunction
            | RestErrorKind::StorageFailureUnknown => Error::Internal(msg),
        }
    }

    /// Check if the caller is expected to retry later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            StatusCode::FailedPrecondition | StatusCode::Aborted | StatusCode::Internal
        ) && !matches!(self, Error::Configuration(_))
    }
}

/// Result type alias for the plugin
pub type Result<T> = std::result::Result<T, Error>;
