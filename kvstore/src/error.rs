//! Error type shared by every store and by the file layer.
//!
//! Each failure carries enough context to diagnose it without a backtrace,
//! and the five structured conditions callers are expected to branch on are
//! exposed through [`StoreError::code`].

use std::fmt;
use std::path::PathBuf;

use crate::constants::State;
use crate::storage::SequenceError;

/// Structured error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadState,
    Missing,
    Locked,
    Corrupted,
    OutOfBounds,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadState => "bad-state",
            Self::Missing => "missing",
            Self::Locked => "locked",
            Self::Corrupted => "corrupted",
            Self::OutOfBounds => "out-of-bounds",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the stores and the file layer.
#[derive(Debug)]
pub enum StoreError {
    /// The operation is not allowed in the handle's current state.
    BadState {
        operation: &'static str,
        state: State,
    },
    /// `create: false` was requested and the store does not exist.
    Missing { path: PathBuf },
    /// Another holder owns the lock file.
    Locked { path: PathBuf, contents: Vec<u8> },
    /// On-disk structures failed validation.
    Corrupted { reason: String },
    /// A logical index outside `[0, length)`.
    OutOfBounds { index: u64, length: u64 },
    /// A caller-supplied value does not fit the store's layout.
    InvalidArgument(String),
    /// The serialization queue could not run the operation.
    Queue(SequenceError),
    /// I/O error.
    Io(std::io::Error),
}

impl StoreError {
    pub(crate) const fn bad_state(operation: &'static str, state: State) -> Self {
        Self::BadState { operation, state }
    }

    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Self::Corrupted {
            reason: reason.into(),
        }
    }

    /// The structured code of this error, if it has one.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::BadState { .. } => Some(ErrorCode::BadState),
            Self::Missing { .. } => Some(ErrorCode::Missing),
            Self::Locked { .. } => Some(ErrorCode::Locked),
            Self::Corrupted { .. } => Some(ErrorCode::Corrupted),
            Self::OutOfBounds { .. } => Some(ErrorCode::OutOfBounds),
            Self::InvalidArgument(_) | Self::Queue(_) | Self::Io(_) => None,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadState { operation, state } => {
                write!(f, "cannot call {operation} while {state}")
            }
            Self::Missing { path } => write!(f, "not found: {}", path.display()),
            Self::Locked { path, contents } => write!(
                f,
                "lock file {} is held by {}",
                path.display(),
                String::from_utf8_lossy(contents)
            ),
            Self::Corrupted { reason } => write!(f, "corrupted: {reason}"),
            Self::OutOfBounds { index, length } => {
                write!(f, "index {index} out of bounds (length: {length})")
            }
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Queue(e) => write!(f, "queue error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Queue(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SequenceError> for StoreError {
    fn from(e: SequenceError) -> Self {
        Self::Queue(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::corrupted(format!("metadata: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let err = StoreError::bad_state("get", State::Closed);
        assert_eq!(err.code(), Some(ErrorCode::BadState));
        assert_eq!(err.to_string(), "cannot call get while closed");

        let err = StoreError::OutOfBounds {
            index: 3,
            length: 3,
        };
        assert_eq!(err.code().map(ErrorCode::as_str), Some("out-of-bounds"));

        let err = StoreError::Io(std::io::Error::other("disk"));
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_locked_display_includes_contents() {
        let err = StoreError::Locked {
            path: PathBuf::from("/tmp/store/lock"),
            contents: b"4242".to_vec(),
        };
        assert_eq!(err.code(), Some(ErrorCode::Locked));
        assert!(err.to_string().contains("4242"));
    }
}
