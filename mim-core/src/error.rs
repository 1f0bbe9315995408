//! Common error types for MIM

use crate::validators::ValidationResult;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Common result type for MIM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every component
#[derive(Error, Debug)]
pub enum Error {
    /// Missing file, missing directory or unknown image identifier
    #[error("Not found: {0}")]
    NotFound(String),

    /// File content is not valid JSON (or not a JSON object)
    #[error("Parse error in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Field missing, wrong-typed or constraint-violated.
    ///
    /// Always carries every violation found, never just the first.
    #[error("{}", describe_validation(path.as_deref(), result))]
    Validation {
        path: Option<PathBuf>,
        result: ValidationResult,
    },

    /// Filesystem failure on read, write or delete
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Identifier already held by the collection
    #[error("Duplicate image id: {0}")]
    Duplicate(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(path.display().to_string())
        } else {
            Error::Io { path, source }
        }
    }

    pub(crate) fn validation(result: ValidationResult) -> Self {
        Error::Validation { path: None, result }
    }

    /// Annotate a validation error with the file it came from.
    ///
    /// Other variants already name their path and are returned unchanged.
    pub fn with_path(self, source_path: &Path) -> Self {
        match self {
            Error::Validation { path: None, result } => Error::Validation {
                path: Some(source_path.to_path_buf()),
                result,
            },
            other => other,
        }
    }

    /// The full violation list when this is a validation failure
    pub fn validation_result(&self) -> Option<&ValidationResult> {
        match self {
            Error::Validation { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

fn describe_validation(path: Option<&Path>, result: &ValidationResult) -> String {
    let issues: Vec<String> = result.errors.iter().map(ToString::to_string).collect();
    match path {
        Some(p) => format!(
            "Validation failed for {} ({} issue(s)): {}",
            p.display(),
            issues.len(),
            issues.join("; ")
        ),
        None => format!(
            "Validation failed ({} issue(s)): {}",
            issues.len(),
            issues.join("; ")
        ),
    }
}
