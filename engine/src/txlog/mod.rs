//! Transaction log.
//!
//! The log is a sequence of versioned files `txlog.0`, `txlog.1`, ... in one
//! directory. Each file starts with a fixed header followed by framed
//! entries. A transaction is written as one batch:
//!
//! ```text
//! Start { tx_id, chunk_id, time } Command* (Commit | Rollback | ChunkEnd)
//! ```
//!
//! Batches never span files: the appender rotates between batches once a
//! file grows past the rotation threshold.
//!
//! # Reading
//!
//! Every reader implements [`CommandBatchCursor`]. The forward cursor follows
//! versions upward. The reversed cursors sketch the batch offsets of a file
//! first, then replay them backwards in chunks bounded by the channel's
//! read-ahead window.

mod appender;
mod channel;
mod cursor;
mod entry;
mod files;
mod metadata;
mod reversed;

pub use appender::{AppendedBatch, LogAppender};
pub use channel::{LogFileChannel, ReadableLogChannel};
pub use cursor::{
    CommandBatch, CommandBatchCursor, ForwardLogCursor, LoggedBatch, Terminator, read_batch,
};
pub use entry::{EntryType, LogEntry};
pub use files::{HEADER_SIZE, LogFiles, LogHeader};
pub use metadata::{TransactionLocator, TransactionMetadata, TransactionMetadataCache};
pub use reversed::{ReversedCursorMonitor, ReversedMultiFileCursor, ReversedSingleFileCursor};

/// A byte position in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition {
    pub log_version: u64,
    pub byte_offset: u64,
}

impl LogPosition {
    #[must_use]
    pub const fn new(log_version: u64, byte_offset: u64) -> Self {
        Self {
            log_version,
            byte_offset,
        }
    }

    /// First entry position of `log_version`.
    #[must_use]
    pub const fn start_of(log_version: u64) -> Self {
        Self::new(log_version, HEADER_SIZE)
    }
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.log_version, self.byte_offset)
    }
}

/// Errors raised by the transaction log.
#[derive(Debug)]
pub enum LogError {
    /// I/O error from the underlying file.
    Io(std::io::Error),
    /// Entry checksum did not match.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Unknown entry type byte.
    InvalidEntryType(u8),
    /// Entry or batch structure is malformed.
    CorruptEntry(String),
    /// The file ends inside an entry.
    Truncated { offset: u64 },
    /// The file ends inside a batch, before its terminator.
    Incomplete { offset: u64 },
    /// A log file header is missing or does not match its file name.
    InvalidHeader { version: u64 },
    /// A channel moved to another log version while a reader relied on it
    /// staying on one.
    VersionCrossed { expected: u64, found: u64 },
    /// A log version that should exist does not.
    MissingVersion(u64),
    /// The channel or cursor was closed.
    Closed,
}

impl LogError {
    /// Whether this error describes a torn tail left by a crash rather than
    /// damage in the middle of the log.
    #[must_use]
    pub const fn is_torn_tail(&self) -> bool {
        matches!(self, Self::Truncated { .. } | Self::Incomplete { .. })
    }
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected:#x}, got {actual:#x}")
            }
            Self::InvalidEntryType(t) => write!(f, "invalid entry type: {t:#x}"),
            Self::CorruptEntry(msg) => write!(f, "corrupt log entry: {msg}"),
            Self::Truncated { offset } => write!(f, "log truncated inside entry at {offset}"),
            Self::Incomplete { offset } => write!(f, "batch starting at {offset} has no terminator"),
            Self::InvalidHeader { version } => write!(f, "invalid header in log version {version}"),
            Self::VersionCrossed { expected, found } => {
                write!(f, "channel crossed from log version {expected} to {found}")
            }
            Self::MissingVersion(v) => write!(f, "log version {v} does not exist"),
            Self::Closed => write!(f, "log channel is closed"),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LogError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
