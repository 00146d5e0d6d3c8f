//! Error taxonomy shared by handlers, the supervisor, and the protocol.
//!
//! Every failure that crosses the procedure-call boundary is an [`Error`]
//! carrying one [`ErrorKind`]. Errors are serializable so they can travel
//! inside a `ProcedureCallResult`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for operations that may cross the protocol boundary.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unknown instance, section, setting, macro, or task.
    NotFound,
    /// Malformed value, type mismatch, or failed validation.
    InvalidInput,
    /// Immutable setting or unauthorized actor.
    PermissionDenied,
    /// The backend does not implement this optional capability.
    NotImplemented,
    /// The backend failed unexpectedly (error, panic, or timeout).
    HandlerFault,
    /// The call is incompatible with the instance's current state.
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::HandlerFault => "handler fault",
            ErrorKind::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    /// `capability` reads as a gerund: "Getting player count", "Setting port".
    pub fn not_implemented(capability: &str) -> Self {
        Self::new(
            ErrorKind::NotImplemented,
            format!("{capability} is unsupported for this instance"),
        )
    }

    pub fn handler_fault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerFault, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Error::permission_denied(e.to_string()),
            _ => Error::handler_fault(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::invalid_input(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = Error::conflict("instance is already running");
        assert_eq!(e.to_string(), "conflict: instance is already running");
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::from(io).is(ErrorKind::NotFound));
    }

    #[test]
    fn serializes_with_kind_name() {
        let e = Error::not_implemented("Getting player count");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "NotImplemented");
        assert_eq!(
            json["message"],
            "Getting player count is unsupported for this instance"
        );
    }
}
