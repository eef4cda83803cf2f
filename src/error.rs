//! Crate-wide error kinds and the error type returned by public APIs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kind identifiers (spec §7). These are matched on by callers
/// (e.g. the CLI, the retry policy) and must never be exception *types* —
/// just a closed tag set. `TestResult.error_kind` (spec §3) carries one of
/// these through storage, so the variants serialize to the same
/// `client_gone`-style identifiers `as_str()` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SuiteNotFound,
    ClientGone,
    ClientNotEligible,
    UnitTimeout,
    UnitFailed,
    Cancelled,
    StorageUnavailable,
    InvalidArgument,
    PreconditionViolated,
    NoSegmentsFound,
    ProviderError,
    Internal,
}

impl ErrorKind {
    /// Transient kinds are retried with backoff (spec §7); terminal kinds
    /// surface immediately.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::UnitTimeout | ErrorKind::ProviderError | ErrorKind::StorageUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SuiteNotFound => "suite_not_found",
            ErrorKind::ClientGone => "client_gone",
            ErrorKind::ClientNotEligible => "client_not_eligible",
            ErrorKind::UnitTimeout => "unit_timeout",
            ErrorKind::UnitFailed => "unit_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::PreconditionViolated => "precondition_violated",
            ErrorKind::NoSegmentsFound => "no_segments_found",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type returned by every fallible public operation in this crate.
#[derive(Debug, Error, Clone)]
#[error("{kind}: {message}")]
pub struct ControlPlaneError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ControlPlaneError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn suite_not_found(id: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::SuiteNotFound, format!("suite not found: {id}"))
    }

    pub fn client_gone(id: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::ClientGone, format!("client gone: {id}"))
    }

    pub fn no_eligible_client() -> Self {
        Self::new(ErrorKind::ClientNotEligible, "no eligible client")
    }

    pub fn precondition_violated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionViolated, message)
    }

    pub fn no_segments_found() -> Self {
        Self::new(ErrorKind::NoSegmentsFound, "no segments found for topic")
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_match_spec() {
        assert!(ErrorKind::UnitTimeout.is_transient());
        assert!(ErrorKind::ProviderError.is_transient());
        assert!(ErrorKind::StorageUnavailable.is_transient());
        assert!(!ErrorKind::InvalidArgument.is_transient());
        assert!(!ErrorKind::PreconditionViolated.is_transient());
        assert!(!ErrorKind::SuiteNotFound.is_transient());
    }

    #[test]
    fn display_uses_stable_identifier() {
        assert_eq!(ErrorKind::ClientGone.to_string(), "client_gone");
    }
}
