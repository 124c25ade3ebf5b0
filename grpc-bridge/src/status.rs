//! Status translation between the generic outcome taxonomy and gRPC codes
//!
//! Middleware speaks in [`StatusKind`], a small protocol-neutral taxonomy that
//! also has an HTTP-like numeric form. The table below is the only place that
//! knows how those outcomes map onto [`tonic::Code`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tonic::{Code, Status};

use crate::error::Error;

/// Protocol-neutral outcome of a call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusKind {
    /// Call succeeded
    #[default]
    Ok,
    /// Malformed or invalid request
    BadRequest,
    /// Missing or invalid credentials
    Unauthenticated,
    /// Caller is not allowed to perform the call
    PermissionDenied,
    /// Requested entity does not exist
    NotFound,
    /// Entity already exists or conflicts with current state
    Conflict,
    /// Quota or rate limit exhausted
    ResourceExhausted,
    /// Call was cancelled
    Cancelled,
    /// Unexpected server-side failure
    Internal,
    /// Method not implemented
    Unimplemented,
    /// Service temporarily unavailable
    Unavailable,
    /// Deadline expired before completion
    DeadlineExceeded,
}

/// Static translation table. Every kind appears exactly once.
const STATUS_TABLE: [(StatusKind, Code, u16); 12] = [
    (StatusKind::Ok, Code::Ok, 200),
    (StatusKind::BadRequest, Code::InvalidArgument, 400),
    (StatusKind::Unauthenticated, Code::Unauthenticated, 401),
    (StatusKind::PermissionDenied, Code::PermissionDenied, 403),
    (StatusKind::NotFound, Code::NotFound, 404),
    (StatusKind::Conflict, Code::AlreadyExists, 409),
    (StatusKind::ResourceExhausted, Code::ResourceExhausted, 429),
    (StatusKind::Cancelled, Code::Cancelled, 499),
    (StatusKind::Internal, Code::Internal, 500),
    (StatusKind::Unimplemented, Code::Unimplemented, 501),
    (StatusKind::Unavailable, Code::Unavailable, 503),
    (StatusKind::DeadlineExceeded, Code::DeadlineExceeded, 504),
];

impl StatusKind {
    /// All kinds, in table order
    pub fn all() -> impl Iterator<Item = StatusKind> {
        STATUS_TABLE.iter().map(|(kind, _, _)| *kind)
    }

    /// The gRPC code for this outcome
    pub fn code(self) -> Code {
        STATUS_TABLE
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map(|(_, code, _)| *code)
            .unwrap_or(Code::Internal)
    }

    /// The HTTP-like numeric status for this outcome
    pub fn http_status(self) -> u16 {
        STATUS_TABLE
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map(|(_, _, http)| *http)
            .unwrap_or(500)
    }

    /// Classify a gRPC code. Codes outside the table map to `Internal`.
    pub fn from_code(code: Code) -> Self {
        STATUS_TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(kind, _, _)| *kind)
            .unwrap_or(StatusKind::Internal)
    }

    /// Classify an HTTP-like status. Any 2xx is `Ok`; unknown codes map to `Internal`.
    pub fn from_http(status: u16) -> Self {
        if (200..300).contains(&status) {
            return StatusKind::Ok;
        }
        STATUS_TABLE
            .iter()
            .find(|(_, _, http)| *http == status)
            .map(|(kind, _, _)| *kind)
            .unwrap_or(StatusKind::Internal)
    }

    /// Whether this outcome is a failure
    pub fn is_error(self) -> bool {
        self != StatusKind::Ok
    }

    /// Build a tonic status for this outcome
    pub fn into_status(self, message: impl Into<String>) -> Status {
        Status::new(self.code(), message)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::BadRequest => "bad-request",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission-denied",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::ResourceExhausted => "resource-exhausted",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
            Self::Unimplemented => "unimplemented",
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline-exceeded",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a pipeline failure into the status delivered to the caller
pub type ErrorTransformer = Arc<dyn Fn(&Error) -> Status + Send + Sync>;

/// Default error-to-status conversion
///
/// Looks for an embedded gRPC status first, then an HTTP-like status, and
/// falls back to `Internal`.
pub fn default_error_transformer(err: &Error) -> Status {
    match err {
        Error::Rpc(status) => Status::new(status.code(), status.message()),
        Error::Http { status, message } => {
            StatusKind::from_http(*status).into_status(message.clone())
        }
        Error::Status { kind, message } => kind.into_status(message.clone()),
        Error::Other(inner) => {
            if let Some(status) = inner.downcast_ref::<Status>() {
                Status::new(status.code(), status.message())
            } else if let Some(nested) = inner.downcast_ref::<Error>() {
                default_error_transformer(nested)
            } else {
                Status::internal(inner.to_string())
            }
        }
        other => Status::internal(other.to_string()),
    }
}

/// Whether a transport error describes a cancellation
///
/// Matches on the code first, then on cancellation or deadline vocabulary in
/// the message.
pub fn is_cancellation_error(code: Code, message: &str) -> bool {
    if matches!(code, Code::Cancelled | Code::DeadlineExceeded) {
        return true;
    }
    let message = message.to_ascii_lowercase();
    ["cancel", "deadline", "aborted by client"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_total_and_unique() {
        let kinds: Vec<_> = StatusKind::all().collect();
        assert_eq!(kinds.len(), 12);

        let mut codes: Vec<i32> = kinds.iter().map(|k| k.code() as i32).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), 12, "each kind must map to a distinct code");
    }

    #[test]
    fn test_round_trip_is_idempotent() {
        for kind in StatusKind::all() {
            let code = kind.code();
            let back = StatusKind::from_code(code);
            assert_eq!(back, kind);
            assert_eq!(StatusKind::from_code(back.code()), kind);
            assert_eq!(StatusKind::from_http(kind.http_status()), kind);
        }
    }

    #[test]
    fn test_unmapped_codes_fall_back_to_internal() {
        assert_eq!(StatusKind::from_code(Code::DataLoss), StatusKind::Internal);
        assert_eq!(StatusKind::from_code(Code::Aborted), StatusKind::Internal);
        assert_eq!(StatusKind::from_http(418), StatusKind::Internal);
        assert_eq!(StatusKind::from_http(204), StatusKind::Ok);
    }

    #[test]
    fn test_specific_mappings() {
        assert_eq!(StatusKind::BadRequest.code(), Code::InvalidArgument);
        assert_eq!(StatusKind::ResourceExhausted.code(), Code::ResourceExhausted);
        assert_eq!(StatusKind::ResourceExhausted.http_status(), 429);
        assert_eq!(StatusKind::Conflict.code(), Code::AlreadyExists);
    }

    #[test]
    fn test_display_uses_kebab_case() {
        assert_eq!(StatusKind::DeadlineExceeded.to_string(), "deadline-exceeded");
        assert_eq!(
            serde_json::to_string(&StatusKind::BadRequest).unwrap(),
            "\"bad-request\""
        );
    }

    #[test]
    fn test_default_transformer() {
        let status = default_error_transformer(&Error::http(403, "nope"));
        assert_eq!(status.code(), Code::PermissionDenied);
        assert_eq!(status.message(), "nope");

        let status = default_error_transformer(&Error::Other(anyhow::Error::new(
            Status::unavailable("backend down"),
        )));
        assert_eq!(status.code(), Code::Unavailable);

        let status = default_error_transformer(&Error::Other(anyhow::anyhow!("plain")));
        assert_eq!(status.code(), Code::Internal);

        let status = default_error_transformer(&Error::Context("no trace id".into()));
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(is_cancellation_error(Code::Cancelled, ""));
        assert!(is_cancellation_error(Code::DeadlineExceeded, ""));
        assert!(is_cancellation_error(Code::Unknown, "Call cancelled by peer"));
        assert!(is_cancellation_error(Code::Internal, "Deadline reached"));
        assert!(!is_cancellation_error(Code::Unavailable, "connection reset"));
    }
}
