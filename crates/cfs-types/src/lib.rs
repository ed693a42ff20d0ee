#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed chunk payload size: files are striped into 64 MiB chunks.
pub const CHUNK_SIZE: u64 = 1 << 26;

/// Filename prefix for checkpoint files (`chkpt.<seq>`).
pub const CHECKPOINT_PREFIX: &str = "chkpt";

/// Filename prefix for operation-log files (`log.<n>`).
pub const LOG_PREFIX: &str = "log";

/// Name of the symlink-style marker pointing at the newest checkpoint/log.
pub const LATEST_LINK: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version counter for a chunk; bumped when a write lease changes hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkVersion(pub u64);

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic sequence number tagging every logged metadata mutation.
///
/// The on-disk invariant is that applied records form a gap-free run: a
/// record is only valid at position `predecessor + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqNo(pub u64);

impl SeqNo {
    pub const ZERO: Self = Self(0);

    /// The sequence number the next applied record must carry.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric suffix of an operation-log file (`log.<n>`).
///
/// Log files must form a gap-free consecutive run from the checkpoint's
/// number forward; a missing file is a fatal recovery error, not a skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogFileNumber(pub u64);

impl LogFileNumber {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for LogFileNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a metadata node is a regular file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }
}

impl std::str::FromStr for NodeKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "dir" => Ok(Self::Dir),
            _ => Err(ParseError::InvalidField {
                field: "kind",
                reason: "expected `file` or `dir`",
            }),
        }
    }
}

/// Validated scatter/gather allocation unit (bytes per fresh block).
///
/// The process-wide default is 4096; tests shrink it to force multi-block
/// chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferUnit(usize);

impl BufferUnit {
    pub const DEFAULT: Self = Self(4096);

    /// Create a `BufferUnit` if `value` is nonzero.
    pub fn new(value: usize) -> Result<Self, ParseError> {
        if value == 0 {
            return Err(ParseError::InvalidField {
                field: "buffer_unit",
                reason: "must be nonzero",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for BufferUnit {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("missing field: {field}")]
    MissingField { field: &'static str },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}
