//! Error types for kiln operations

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Filesystem-level errors.
///
/// `NotFound` is a legitimate control-flow outcome (a missing record means
/// "populate", a missing source file means "not fresh"), so it is kept apart
/// from every other I/O failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Not found: {path}")]
    NotFound { path: PathBuf },

    #[error("I/O error at {path} ({kind:?}): {reason}")]
    Io {
        path: PathBuf,
        kind: io::ErrorKind,
        reason: String,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Classify an `io::Error` raised while touching `path`.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                kind: err.kind(),
                reason: err.to_string(),
            }
        }
    }

    /// Returns true if this is the distinguished not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Record serialization errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Record has no metadata delimiter")]
    MissingDelimiter,

    #[error("Malformed record metadata: {reason}")]
    MalformedMetadata { reason: String },

    #[error("Payload {name} spans {start}..{end} outside a blob of {len} bytes")]
    PayloadOutOfBounds {
        name: String,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("Metadata field {field} is reserved")]
    ReservedField { field: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all kiln errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KilnError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Populate failed for {key}: {reason}")]
    Populate { key: String, reason: String },

    #[error("read operations not permitted on already destructed instances")]
    Destructed,
}

impl KilnError {
    /// Shorthand for [`StorageError::from_io`] lifted into `KilnError`.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        Self::Storage(StorageError::from_io(path, err))
    }

    /// Build a populate failure for `key`.
    pub fn populate(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Populate {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this wraps [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_not_found())
    }
}

/// Result type alias for kiln operations.
pub type KilnResult<T> = Result<T, KilnError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_not_found_is_distinguished() {
        let err = StorageError::from_io(
            Path::new("/tmp/kiln/missing"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
        assert_eq!(
            err,
            StorageError::NotFound {
                path: PathBuf::from("/tmp/kiln/missing")
            }
        );
    }

    #[test]
    fn test_from_io_other_kinds_keep_reason() {
        let err = StorageError::from_io(
            Path::new("/tmp/kiln/locked"),
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(!err.is_not_found());
        let msg = err.to_string();
        assert!(msg.contains("PermissionDenied"));
        assert!(msg.contains("nope"));
        assert!(msg.contains("/tmp/kiln/locked"));
    }

    #[test]
    fn test_kiln_error_is_not_found() {
        let err = KilnError::from_io(
            Path::new("a"),
            io::Error::new(io::ErrorKind::NotFound, "x"),
        );
        assert!(err.is_not_found());
        assert!(!KilnError::Destructed.is_not_found());
    }

    #[test]
    fn test_destructed_display() {
        assert_eq!(
            KilnError::Destructed.to_string(),
            "read operations not permitted on already destructed instances"
        );
    }

    #[test]
    fn test_codec_error_display_out_of_bounds() {
        let err = CodecError::PayloadOutOfBounds {
            name: "sourceMap".to_string(),
            start: 10,
            end: 40,
            len: 20,
        };
        let msg = err.to_string();
        assert!(msg.contains("sourceMap"));
        assert!(msg.contains("10..40"));
        assert!(msg.contains("20 bytes"));
    }

    #[test]
    fn test_kiln_error_from_variants() {
        let storage = KilnError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, KilnError::Storage(_)));

        let codec = KilnError::from(CodecError::MissingDelimiter);
        assert!(matches!(codec, KilnError::Codec(_)));

        let config = KilnError::from(ConfigError::MissingRequired {
            field: "populate".to_string(),
        });
        assert!(matches!(config, KilnError::Config(_)));
    }
}
