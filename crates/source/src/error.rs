//! Source Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Every failure a caller can observe
//! maps onto one of five categories; [`ErrorKind::code()`] returns the tag
//! that crosses the process boundary.

use crate::capability::Capability;
use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A source error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for source operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// URI could not be parsed at all (empty, no scheme delimiter, or a shape
    /// the scheme cannot address). Never worth retrying.
    #[display("invalid uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },
    /// No handler registered for the parsed scheme.
    #[display("no handler registered for scheme `{_0}`")]
    UnknownScheme(#[error(not(source))] String),
    /// Handler exists but does not support the requested operation. Callers
    /// should have consulted the handler's capabilities first.
    #[display("scheme `{scheme}` does not support {capability}")]
    UnsupportedCapability { scheme: String, capability: Capability },
    /// Underlying OS operation failed. Path and cause are both kept so the
    /// rendered message is useful on the far side of the process boundary.
    #[display("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: IoError },
    /// A handler for this scheme was already registered.
    #[display("scheme already registered: {_0}")]
    DuplicateScheme(#[error(not(source))] String),
}

impl ErrorKind {
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri { uri: uri.into(), reason: reason.into() }
    }

    pub fn unsupported(scheme: impl Into<String>, capability: Capability) -> Self {
        Self::UnsupportedCapability { scheme: scheme.into(), capability }
    }

    pub fn io(path: impl Into<PathBuf>, source: IoError) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Stable tag for this category, as reported to remote callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUri { .. } => "InvalidUri",
            Self::UnknownScheme(_) => "UnknownScheme",
            Self::UnsupportedCapability { .. } => "UnsupportedCapability",
            Self::Io { .. } => "IOError",
            Self::DuplicateScheme(_) => "DuplicateScheme",
        }
    }

    /// Returns `true` if retrying might succeed.
    ///
    /// Nothing in this crate retries on its own; this is advice for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Returns `true` if the underlying I/O failure was a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::invalid_uri("", "empty"), "InvalidUri")]
    #[case(ErrorKind::UnknownScheme("https".to_string()), "UnknownScheme")]
    #[case(ErrorKind::unsupported("http", Capability::Watch), "UnsupportedCapability")]
    #[case(ErrorKind::io("/tmp/x", IoError::other("boom")), "IOError")]
    #[case(ErrorKind::DuplicateScheme("file".to_string()), "DuplicateScheme")]
    fn error_kind_code(#[case] kind: ErrorKind, #[case] expected: &str) {
        assert_eq!(kind.code(), expected);
    }

    #[test]
    fn error_kind_display() {
        assert_eq!(
            ErrorKind::unsupported("http", Capability::Watch).to_string(),
            "scheme `http` does not support watch"
        );
        assert_eq!(ErrorKind::UnknownScheme("https".to_string()).to_string(), "no handler registered for scheme `https`");
        let io = ErrorKind::io("/missing/file.txt", IoError::new(std::io::ErrorKind::NotFound, "No such file"));
        let message = io.to_string();
        assert!(message.contains("/missing/file.txt"));
        assert!(message.contains("No such file"));
    }

    #[test]
    fn error_kind_retryable() {
        assert!(ErrorKind::io("/tmp/x", IoError::other("boom")).is_retryable());
        assert!(!ErrorKind::invalid_uri("nope", "no scheme").is_retryable());
        assert!(!ErrorKind::unsupported("http", Capability::Open).is_retryable());
    }

    #[test]
    fn error_kind_not_found() {
        assert!(ErrorKind::io("/x", IoError::new(std::io::ErrorKind::NotFound, "gone")).is_not_found());
        assert!(!ErrorKind::io("/x", IoError::new(std::io::ErrorKind::PermissionDenied, "no")).is_not_found());
    }

    #[test]
    fn error_from_kind() {
        let err: Error = exn::Exn::from(ErrorKind::DuplicateScheme("file".to_string()));
        // Exn<E> implements Deref<Target = E>
        assert!(matches!(&*err, ErrorKind::DuplicateScheme(scheme) if scheme == "file"));
    }
}
