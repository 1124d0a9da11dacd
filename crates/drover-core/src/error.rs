//! Error taxonomy shared across the fabric.
//!
//! Every fallible API in the workspace returns [`Error`], which is a kind
//! plus detail text. The kind — not the concrete source — is what crosses
//! the wire to operators, so handlers match on [`Error::kind`] rather than
//! downcasting.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kind, stable across the operator wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown minion, state bucket, or on-disk record.
    NotFound,
    /// Invalid selection expression, empty target list, malformed input.
    BadRequest,
    /// Duplicate stream for an already-attached minion name.
    Conflict,
    /// Identity proof failed or policy refused the peer.
    Unauthorized,
    /// Stream down or transport-level disconnect.
    Unavailable,
    /// Call deadline exceeded.
    Timeout,
    /// Crypto, codec, or filesystem failure.
    Internal,
}

impl ErrorKind {
    /// Canonical wire string for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    /// Parses a wire string back into a kind.
    ///
    /// Unknown strings map to [`ErrorKind::Internal`] so a newer master
    /// never crashes an older client.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "not-found" => Self::NotFound,
            "bad-request" => Self::BadRequest,
            "conflict" => Self::Conflict,
            "unauthorized" => Self::Unauthorized,
            "unavailable" => Self::Unavailable,
            "timeout" => Self::Timeout,
            _ => Self::Internal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fabric-wide error: a kind plus human-readable detail.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct Error {
    /// Stable error classification.
    pub kind: ErrorKind,
    /// Human-readable detail, safe to surface to operators.
    pub detail: String,
}

impl Error {
    /// Creates an error with the given kind and detail.
    #[must_use]
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Unknown minion, state bucket, or record.
    #[must_use]
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    /// Invalid input from the caller.
    #[must_use]
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, detail)
    }

    /// Duplicate stream or conflicting state.
    #[must_use]
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, detail)
    }

    /// Identity proof or policy refusal.
    #[must_use]
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, detail)
    }

    /// Transport down or peer gone.
    #[must_use]
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, detail)
    }

    /// Deadline exceeded.
    #[must_use]
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, detail)
    }

    /// Crypto, codec, or filesystem failure.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// True when the kind is [`ErrorKind::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// True when the kind is [`ErrorKind::Conflict`].
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }

    /// True when the kind is [`ErrorKind::Timeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("i/o: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("json codec: {err}"))
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::internal(format!("msgpack encode: {err}"))
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::internal(format!("msgpack decode: {err}"))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Self::internal(format!("protobuf decode: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_wire_string() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::BadRequest,
            ErrorKind::Conflict,
            ErrorKind::Unauthorized,
            ErrorKind::Unavailable,
            ErrorKind::Timeout,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_str_lossy(kind.as_str()), kind);
        }
    }

    #[test]
    fn unknown_kind_string_maps_to_internal() {
        assert_eq!(ErrorKind::from_str_lossy("gremlins"), ErrorKind::Internal);
    }

    #[test]
    fn display_carries_kind_and_detail() {
        let err = Error::not_found("minion web01");
        assert_eq!(err.to_string(), "not-found: minion web01");
        assert!(err.is_not_found());
    }
}
