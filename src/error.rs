//! Error types shared across the core.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Raised when an operation is interrupted by a cancelled token.
///
/// Cancellation is deliberate and callers must treat it differently from a
/// failure; `timed_out` distinguishes auto-cancel timeouts from explicit
/// cancels.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct CancelledError {
    pub reason: String,
    pub timed_out: bool,
}

impl CancelledError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            timed_out: false,
        }
    }
}

/// Why a downloaded artifact failed its integrity gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityKind {
    SizeMismatch { expected: u64, actual: u64 },
    HashMismatch { expected: String, actual: String },
}

impl fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch { expected, actual } => {
                write!(f, "expected {expected} bytes, found {actual}")
            }
            Self::HashMismatch { expected, actual } => {
                write!(f, "expected SHA-256 {expected}, computed {actual}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    /// A response that had to be successful was not.
    #[error("{url} responded with HTTP {status}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("integrity check failed for {}: {kind}", .path.display())]
    Integrity { path: PathBuf, kind: IntegrityKind },

    #[error("{context}")]
    Process {
        context: String,
        exit_code: Option<i32>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("cancellation source has been disposed")]
    Disposed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for deliberate aborts, which are never failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
