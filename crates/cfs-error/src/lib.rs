#![forbid(unsafe_code)]
//! Error types for ChunkFS.
//!
//! Defines `CfsError` and a `Result<T>` alias used throughout the workspace.
//! Disk-completion callbacks deliver errno-shaped results, so errno mappings
//! live here as well.

use thiserror::Error;

/// Unified error type for all ChunkFS operations.
#[derive(Debug, Error)]
pub enum CfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("async submission refused: {0}")]
    SubmissionRefused(std::io::Error),

    #[error("malformed record at line {line}: {detail}")]
    MalformedRecord { line: u64, detail: String },

    #[error("log sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl CfsError {
    /// Convert this error into a POSIX errno for callers that speak errno
    /// (disk-completion results, operational tooling exit codes).
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) | Self::SubmissionRefused(err) => {
                err.raw_os_error().unwrap_or(libc::EIO)
            }
            Self::MalformedRecord { .. } | Self::SequenceGap { .. } | Self::Format(_) => {
                libc::EINVAL
            }
            Self::Cancelled => libc::ECANCELED,
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// True when the underlying condition is the transient "try again on the
    /// next event-loop pass" case rather than a hard failure.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        match self {
            Self::Io(err) => err.kind() == std::io::ErrorKind::WouldBlock,
            _ => false,
        }
    }

    /// The canonical transient-I/O error (maps to `EAGAIN`).
    #[must_use]
    pub fn would_block() -> Self {
        Self::Io(std::io::Error::from_raw_os_error(libc::EAGAIN))
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_taxonomy() {
        assert_eq!(
            CfsError::SequenceGap {
                expected: 103,
                found: 104
            }
            .to_errno(),
            libc::EINVAL
        );
        assert_eq!(CfsError::Cancelled.to_errno(), libc::ECANCELED);
        assert_eq!(CfsError::NotFound("chkpt".to_owned()).to_errno(), libc::ENOENT);
        assert_eq!(CfsError::would_block().to_errno(), libc::EAGAIN);
    }

    #[test]
    fn would_block_is_transient() {
        assert!(CfsError::would_block().is_would_block());
        assert!(!CfsError::Cancelled.is_would_block());
    }
}
