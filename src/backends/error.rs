//! Backend Error Taxonomy
//!
//! Every interaction with the appliance ends either in success or in exactly
//! one [`RestErrorKind`] plus a human-readable message. Callers match on the
//! kind exhaustively; the message is for operators.

use std::fmt;
use thiserror::Error;

/// Classification of a failed backend interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestErrorKind {
    /// Backend failed in a way the adapter could not attribute
    Unknown,
    /// Resource is in use (active session, dependent snapshot or clone)
    ResourceBusy,
    /// Transport-level failure before the request reached backend logic
    RequestMalfunction,
    /// Resource does not exist
    ResourceDoesNotExist,
    /// Connection refused or timed out
    UnableToConnect,
    /// Backend replied but the body was unparseable or missing fields
    ResponseProcessingMalfunction,
    /// Backend replied with an error envelope carrying an errno the
    /// adapter does not special-case
    StorageFailureUnknown,
    /// Resource already exists
    ObjectExists,
}

impl fmt::Display for RestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestErrorKind::Unknown => write!(f, "Unknown internal error"),
            RestErrorKind::ResourceBusy => write!(f, "Resource is busy"),
            RestErrorKind::RequestMalfunction => write!(f, "Malfunction"),
            RestErrorKind::ResourceDoesNotExist => write!(f, "Resource does not exist"),
            RestErrorKind::UnableToConnect => write!(f, "Unable to connect"),
            RestErrorKind::ResponseProcessingMalfunction => {
                write!(f, "Failure during processing response from server")
            }
            RestErrorKind::StorageFailureUnknown => write!(f, "Storage failure"),
            RestErrorKind::ObjectExists => write!(f, "Object exists"),
        }
    }
}

/// A classified backend failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {}", .kind, .message)]
pub struct RestError {
    pub kind: RestErrorKind,
    pub message: String,
}

impl RestError {
    /// Create a new backend error
    pub fn new(kind: RestErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Check whether this error is of the given kind
    pub fn is(&self, kind: RestErrorKind) -> bool {
        self.kind == kind
    }
}

/// Result type for backend adapter operations
pub type RestResult<T> = std::result::Result<T, RestError>;
