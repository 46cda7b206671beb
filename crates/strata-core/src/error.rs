//! Error types shared by every strata crate.
//!
//! Every failure maps onto one [`ErrorKind`]. Callers branch on the kind (or
//! the exit code derived from it) rather than on message text.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::canonical::CanonicalError;
use crate::digest::Digest;

/// How many conflicts or offending paths an error message spells out.
pub const CONFLICT_LIST_LIMIT: usize = 5;

/// How many import mismatches an error message spells out.
pub const MISMATCH_LIST_LIMIT: usize = 20;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Transport,
    UnsupportedMediaType,
    RoleLayerMismatch,
    WorkdirConflict,
    Io,
}

impl ErrorKind {
    /// Process exit code for this category.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::NotFound => 1,
            Self::Validation => 2,
            Self::Transport => 3,
            Self::UnsupportedMediaType => 4,
            Self::Io => 5,
            Self::RoleLayerMismatch => 11,
            Self::WorkdirConflict => 12,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Transport => "transport",
            Self::UnsupportedMediaType => "unsupported_media_type",
            Self::RoleLayerMismatch => "role_layer_mismatch",
            Self::WorkdirConflict => "workdir_conflict",
            Self::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file whose on-disk content differs from what the bundle expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub path: String,
    pub expected: Digest,
    /// `None` when the node is not a regular file (e.g. a directory).
    pub actual: Option<Digest>,
}

impl fmt::Display for ConflictRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.actual {
            Some(actual) => write!(
                f,
                "{} (expected {}, found {})",
                self.path, self.expected, actual
            ),
            None => write!(
                f,
                "{} (expected {}, found a non-file node)",
                self.path, self.expected
            ),
        }
    }
}

/// An external entry whose prefetch did not produce a verified local copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub path: String,
    pub uri: String,
    pub reason: String,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}: {}", self.path, self.uri, self.reason)
    }
}

/// Bundle engine errors.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// Reference, blob, or path does not resolve.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Malformed bundle reference.
    #[error("invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Generic validation failure (malformed JSON, bad authoring input).
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Path that may not appear in a bundle or archive.
    #[error("unsafe path '{path}': {reason}")]
    UnsafePath { path: String, reason: String },

    /// Canonical encoding rejected a value.
    #[error("canonicalization failed: {0}")]
    Canonical(#[from] CanonicalError),

    /// Content hash did not match the expected digest.
    #[error("digest mismatch for {subject}: expected {expected}, got {actual}")]
    DigestMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    /// Archive contains content that cannot be exported deterministically.
    #[error("archive rejected: {}", render_list(.offenders, .total))]
    ArchiveRejected { offenders: Vec<String>, total: usize },

    /// Imported files did not match the expected inventory.
    #[error("import verification failed: {}", render_list(.mismatches, .total))]
    ImportMismatch {
        mismatches: Vec<String>,
        total: usize,
    },

    /// Document declares a media type the engine does not understand.
    #[error("unsupported media type '{media_type}' for {subject}")]
    UnsupportedMediaType { media_type: String, subject: String },

    /// Network, auth, or storage backend failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Credentials rejected by a collaborator.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// One or more external prefetches failed.
    #[error("prefetch failed: {}", render_list(.failures, .total))]
    PrefetchFailed {
        failures: Vec<FetchFailure>,
        total: usize,
    },

    /// Requested role is not defined by the bundle.
    #[error("role '{role}' not found; available roles: {}", render_names(.available))]
    RoleNotFound { role: String, available: Vec<String> },

    /// No role was requested and the bundle has no `default` role.
    #[error("no role selected and bundle has no 'default' role; available roles: {}", render_names(.available))]
    NoRoleSelected { available: Vec<String> },

    /// Role references layers the manifest does not contain.
    #[error("role '{role}' references missing layers: {}", render_names(.missing))]
    MissingLayers { role: String, missing: Vec<String> },

    /// On-disk content differs from the bundle and overwrite was off.
    #[error("workdir conflict: {}", render_list(.conflicts, .total))]
    WorkdirConflict {
        conflicts: Vec<ConflictRecord>,
        total: usize,
    },

    /// Local filesystem failure.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BundleError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,

            Self::InvalidReference { .. }
            | Self::Validation { .. }
            | Self::UnsafePath { .. }
            | Self::Canonical(_)
            | Self::DigestMismatch { .. }
            | Self::ArchiveRejected { .. }
            | Self::ImportMismatch { .. } => ErrorKind::Validation,

            Self::UnsupportedMediaType { .. } => ErrorKind::UnsupportedMediaType,

            Self::Transport { .. } | Self::Unauthorized { .. } | Self::PrefetchFailed { .. } => {
                ErrorKind::Transport
            }

            Self::RoleNotFound { .. } | Self::NoRoleSelected { .. } | Self::MissingLayers { .. } => {
                ErrorKind::RoleLayerMismatch
            }

            Self::WorkdirConflict { .. } => ErrorKind::WorkdirConflict,

            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Build a capped conflict error from the full conflict list.
    pub fn workdir_conflict(mut conflicts: Vec<ConflictRecord>) -> Self {
        let total = conflicts.len();
        conflicts.truncate(CONFLICT_LIST_LIMIT);
        Self::WorkdirConflict { conflicts, total }
    }

    /// Build a capped archive rejection from every offending path.
    pub fn archive_rejected(mut offenders: Vec<String>) -> Self {
        let total = offenders.len();
        offenders.truncate(CONFLICT_LIST_LIMIT);
        Self::ArchiveRejected { offenders, total }
    }

    /// Build a capped import mismatch error.
    pub fn import_mismatch(mut mismatches: Vec<String>) -> Self {
        let total = mismatches.len();
        mismatches.truncate(MISMATCH_LIST_LIMIT);
        Self::ImportMismatch { mismatches, total }
    }

    pub fn prefetch_failed(mut failures: Vec<FetchFailure>) -> Self {
        let total = failures.len();
        failures.truncate(MISMATCH_LIST_LIMIT);
        Self::PrefetchFailed { failures, total }
    }

    /// Whether this error means "nothing there" rather than a hard failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for bundle operations.
pub type BundleResult<T> = Result<T, BundleError>;

fn render_list<T: fmt::Display>(items: &[T], total: &usize) -> String {
    let total = *total;
    let mut out = format!("{} item(s)", total);
    for item in items {
        out.push_str("\n  - ");
        out.push_str(&item.to_string());
    }
    if total > items.len() {
        out.push_str(&format!("\n  ... and {} more", total - items.len()));
    }
    out
}

fn render_names(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(i: usize) -> ConflictRecord {
        ConflictRecord {
            path: format!("src/file{}.py", i),
            expected: Digest::of_bytes(b"expected"),
            actual: Some(Digest::of_bytes(format!("actual{}", i).as_bytes())),
        }
    }

    #[test]
    fn test_kinds_are_distinct_exit_codes() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::Validation,
            ErrorKind::Transport,
            ErrorKind::UnsupportedMediaType,
            ErrorKind::RoleLayerMismatch,
            ErrorKind::WorkdirConflict,
            ErrorKind::Io,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert_eq!(ErrorKind::RoleLayerMismatch.exit_code(), 11);
        assert_eq!(ErrorKind::WorkdirConflict.exit_code(), 12);
    }

    #[test]
    fn test_workdir_conflict_caps_listing() {
        let err = BundleError::workdir_conflict((0..8).map(conflict).collect());
        match &err {
            BundleError::WorkdirConflict { conflicts, total } => {
                assert_eq!(conflicts.len(), CONFLICT_LIST_LIMIT);
                assert_eq!(*total, 8);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("src/file0.py"));
        assert!(message.contains("src/file4.py"));
        assert!(!message.contains("src/file5.py"));
        assert!(message.contains("and 3 more"));
        assert_eq!(err.kind(), ErrorKind::WorkdirConflict);
    }

    #[test]
    fn test_role_errors_list_names() {
        let err = BundleError::RoleNotFound {
            role: "serving".into(),
            available: vec!["runtime".into(), "training".into()],
        };
        assert_eq!(err.kind(), ErrorKind::RoleLayerMismatch);
        assert!(err.to_string().contains("runtime, training"));

        let err = BundleError::MissingLayers {
            role: "training".into(),
            missing: vec!["data".into()],
        };
        assert!(err.to_string().contains("data"));
    }

    #[test]
    fn test_import_mismatch_cap() {
        let err = BundleError::import_mismatch((0..25).map(|i| format!("f{}", i)).collect());
        match err {
            BundleError::ImportMismatch { mismatches, total } => {
                assert_eq!(mismatches.len(), MISMATCH_LIST_LIMIT);
                assert_eq!(total, 25);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
