//! Error types for the backup core library.

use std::path::{Path, PathBuf};

/// The main error type for backup operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid arguments: bad cipher name, bad rate suffix, non-existent input path.
    #[error("invalid input: {message}")]
    Input { message: String },

    /// Policy violation: `forced` snapshot but inputs span multiple LVs or none,
    /// or an empty input set with `forced`.
    #[error("precondition failed: {message}")]
    Precondition { message: String },

    /// I/O error with optional path context: source/archive read or write,
    /// child process failure, subprocess nonzero exit.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Snapshot create/mount/unmount/remove failure, or snap_percent >= 99%.
    #[error("snapshot error: {message}")]
    Snapshot { message: String },

    /// AES or KDF error.
    #[error("cryptographic error: {message}")]
    Crypto { message: String },

    /// Verifier-only: hash mismatch, truncated archive, missing or malformed meta.
    #[error("integrity check failed: {message}")]
    Integrity { message: String },

    /// Cooperative stop observed.
    #[error("operation cancelled")]
    Cancelled,
}

/// A specialized Result type for backup operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid-input error.
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
        }
    }

    /// Create a precondition-failure error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a snapshot-lifecycle error.
    pub fn snapshot(message: impl Into<String>) -> Self {
        Self::Snapshot {
            message: message.into(),
        }
    }

    /// Create a cryptographic error.
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create an integrity-check error.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Returns true if this error represents a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Recovers the original `Error` crossing an `io::Write` boundary (e.g.
    /// `WriterChain`'s `Write` impl, which can only report failures as
    /// `io::Error`) instead of flattening it into a generic I/O error. This
    /// keeps a `CancelLink` abort reported through `tar::Builder` reporting
    /// as `Error::Cancelled` rather than `Error::Io`.
    pub(crate) fn from_write_boundary(source: std::io::Error, path: Option<&Path>) -> Self {
        match source.into_inner() {
            Some(inner) => match inner.downcast::<Error>() {
                Ok(original) => *original,
                Err(inner) => Self::Io {
                    source: std::io::Error::new(std::io::ErrorKind::Other, inner),
                    path: path.map(Path::to_path_buf),
                },
            },
            None => Self::Io {
                source,
                path: path.map(Path::to_path_buf),
            },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
