//! Serializable API error types shared by the peer RPC surface and the local
//! command surface (§6, §7). `ErrorResponse` is the only error struct that
//! actually crosses the wire; everything else converts to/from it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ErrorCode = u16;

/// The wire-level representation of any API error. For displaying a
/// human-readable message, match on [`ErrorKind`] first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub msg: String,
}

/// An HTTP status code, decoupled from any particular HTTP crate so this
/// module has no framework dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HttpStatus(pub u16);

impl HttpStatus {
    pub const BAD_REQUEST: HttpStatus = HttpStatus(400);
    pub const UNAUTHORIZED: HttpStatus = HttpStatus(401);
    pub const CONFLICT: HttpStatus = HttpStatus(409);
    pub const INTERNAL_SERVER_ERROR: HttpStatus = HttpStatus(500);
    pub const SERVICE_UNAVAILABLE: HttpStatus = HttpStatus(503);
}

/// The taxonomy from the spec's error handling design (§7), independent of
/// which surface (peer RPC or local command) raised it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad input, invalid address, insufficient balance, duplicate channel,
    /// empty amount. No state change; returned to the caller.
    Validation = 1,
    /// Simultaneous-open tie-break loser; the peer should retry once
    /// cleanup completes.
    ExistsRetriable = 2,
    /// The channel already exists and is not closing; not retriable.
    Exists = 3,
    /// The signing seed is unavailable (watchtower mode). Rolled back; the
    /// peer should retry after the agent re-authenticates.
    SeedUnavailable = 4,
    /// The agent is shutting down; reject new write-transactions.
    AgentClosing = 5,
    /// An internal/fatal error occurred.
    Internal = 6,
}

impl ErrorKind {
    pub fn to_http_status(self) -> HttpStatus {
        match self {
            ErrorKind::Validation => HttpStatus::BAD_REQUEST,
            ErrorKind::ExistsRetriable => HttpStatus::CONFLICT,
            ErrorKind::Exists => HttpStatus::CONFLICT,
            ErrorKind::SeedUnavailable => HttpStatus::UNAUTHORIZED,
            ErrorKind::AgentClosing => HttpStatus::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => HttpStatus::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a peer that received this error should retransmit later,
    /// per the retriable-conflict contract in spec §4.4/§7.
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorKind::ExistsRetriable | ErrorKind::SeedUnavailable)
    }
}

/// A generic API error carrying both a [`ErrorKind`] and a human message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind:?}: {msg}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub msg: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }
}

impl From<ApiError> for ErrorResponse {
    fn from(e: ApiError) -> Self {
        ErrorResponse {
            code: e.kind as ErrorCode,
            msg: e.msg,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exists_retriable_is_retriable_and_conflict() {
        let kind = ErrorKind::ExistsRetriable;
        assert!(kind.is_retriable());
        assert_eq!(kind.to_http_status(), HttpStatus::CONFLICT);
    }

    #[test]
    fn validation_is_not_retriable() {
        assert!(!ErrorKind::Validation.is_retriable());
    }
}
