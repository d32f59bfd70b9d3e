use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the cache, the resolvers and the dependency manager.
///
/// Nothing in the library retries or swallows these; the caller decides what
/// is transient.
#[derive(Error, Debug)]
pub enum DepError {
    /// The package string is not a valid `registry/repository` reference.
    #[error("invalid package reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// No cache entry exists for the derived key.
    #[error("package '{key}' not found in cache")]
    NotFound {
        key: String,
        #[source]
        source: io::Error,
    },

    /// The constraint could not be resolved or the artifact could not be fetched.
    #[error("failed to resolve '{package}' ({constraint}): {reason}")]
    ResolutionFailed {
        package: String,
        constraint: String,
        reason: String,
    },

    /// Creating or writing a cache entry failed.
    #[error("failed to write cache entry {}", .path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Removing the cache failed; the cache was left untouched.
    #[error("failed to clean cache {}", .path.display())]
    CleanFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A cache entry exists but could not be read or decoded.
    #[error("failed to read cache entry {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },

    /// The fetched artifact is not a valid Crossplane package.
    #[error("invalid package: {0}")]
    InvalidPackage(String),

    /// The workspace metadata file is missing or malformed.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// Cache or registry settings cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DepError {
    pub(crate) fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn resolution(package: &str, constraint: &str, reason: impl Into<String>) -> Self {
        Self::ResolutionFailed {
            package: package.to_string(),
            constraint: constraint.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the underlying io error, if this error wraps one.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::NotFound { source, .. }
            | Self::WriteFailed { source, .. }
            | Self::CleanFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// True when the failure was caused by missing permissions.
    pub fn is_permission_denied(&self) -> bool {
        self.io_error()
            .is_some_and(|e| e.kind() == io::ErrorKind::PermissionDenied)
    }
}

pub type Result<T> = std::result::Result<T, DepError>;
