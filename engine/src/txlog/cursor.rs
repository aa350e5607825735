//! Command batches and the forward log cursor.

use crate::kernel::StorageCommand;
use crate::txlog::{LogEntry, LogError, LogFileChannel, LogFiles, LogPosition, ReadableLogChannel};

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Commit,
    Rollback,
    /// More chunks of the same transaction follow.
    ChunkEnd,
}

/// One transaction, or one chunk of it, as written to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBatch {
    pub tx_id: u64,
    pub chunk_id: u32,
    pub time_millis: u64,
    pub commands: Vec<StorageCommand>,
    pub terminator: Terminator,
}

impl CommandBatch {
    /// A single-chunk committed transaction.
    #[must_use]
    pub const fn committed(tx_id: u64, time_millis: u64, commands: Vec<StorageCommand>) -> Self {
        Self {
            tx_id,
            chunk_id: 0,
            time_millis,
            commands,
            terminator: Terminator::Commit,
        }
    }

    /// Entries of this batch in write order.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        let mut entries = Vec::with_capacity(self.commands.len() + 2);
        entries.push(LogEntry::Start {
            tx_id: self.tx_id,
            chunk_id: self.chunk_id,
            time_millis: self.time_millis,
        });
        entries.extend(self.commands.iter().copied().map(LogEntry::Command));
        entries.push(match self.terminator {
            Terminator::Commit => LogEntry::Commit {
                tx_id: self.tx_id,
                time_millis: self.time_millis,
            },
            Terminator::Rollback => LogEntry::Rollback {
                tx_id: self.tx_id,
                time_millis: self.time_millis,
            },
            Terminator::ChunkEnd => LogEntry::ChunkEnd {
                tx_id: self.tx_id,
                chunk_id: self.chunk_id,
            },
        });
        entries
    }
}

/// A batch read back from the log with where it lies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedBatch {
    pub batch: CommandBatch,
    /// Position of the `Start` entry.
    pub start: LogPosition,
    /// Position right after the terminator.
    pub end: LogPosition,
}

/// Pull-based reader over logged batches.
pub trait CommandBatchCursor {
    /// Move to the next batch.
    fn next(&mut self) -> Result<bool, LogError>;

    /// The current batch, `None` before the first `next()` and after the end.
    fn get(&self) -> Option<&LoggedBatch>;

    /// Where a reader continuing from the current batch would resume.
    fn position(&self) -> LogPosition;

    /// Closing twice is a no-op.
    fn close(&mut self) -> Result<(), LogError>;
}

/// Read one batch. `Ok(None)` when the channel is at a clean end of file.
///
/// A file that ends after the `Start` entry but before the terminator is
/// `LogError::Incomplete`.
pub fn read_batch<C: ReadableLogChannel + ?Sized>(
    channel: &mut C,
) -> Result<Option<LoggedBatch>, LogError> {
    let start = channel.log_position();
    let (tx_id, chunk_id, time_millis) = match channel.read_entry()? {
        None => return Ok(None),
        Some(LogEntry::Start {
            tx_id,
            chunk_id,
            time_millis,
        }) => (tx_id, chunk_id, time_millis),
        Some(other) => {
            return Err(LogError::CorruptEntry(format!(
                "batch at {start} opens with {:?}",
                other.entry_type()
            )));
        }
    };

    let mut commands = Vec::new();
    let terminator = loop {
        let entry = match channel.read_entry() {
            Ok(Some(entry)) => entry,
            Ok(None) | Err(LogError::Truncated { .. }) => {
                return Err(LogError::Incomplete {
                    offset: start.byte_offset,
                });
            }
            Err(e) => return Err(e),
        };
        match entry {
            LogEntry::Command(command) => commands.push(command),
            LogEntry::Commit { tx_id: id, .. } if id == tx_id => break Terminator::Commit,
            LogEntry::Rollback { tx_id: id, .. } if id == tx_id => break Terminator::Rollback,
            LogEntry::ChunkEnd { tx_id: id, .. } if id == tx_id => break Terminator::ChunkEnd,
            other => {
                return Err(LogError::CorruptEntry(format!(
                    "unexpected {:?} inside batch of tx {tx_id} at {start}",
                    other.entry_type()
                )));
            }
        }
    };

    Ok(Some(LoggedBatch {
        batch: CommandBatch {
            tx_id,
            chunk_id,
            time_millis,
            commands,
            terminator,
        },
        start,
        end: channel.log_position(),
    }))
}

/// Reads batches in log order, moving on to higher versions as each file
/// ends.
///
/// A torn batch at the end of the newest file ends the log; `position()` stays
/// right after the last complete batch.
#[derive(Debug)]
pub struct ForwardLogCursor {
    files: LogFiles,
    channel: Option<LogFileChannel>,
    read_ahead: usize,
    current: Option<LoggedBatch>,
    position: LogPosition,
}

impl ForwardLogCursor {
    /// Start reading at `from`, which must be a batch boundary.
    pub fn open(files: &LogFiles, from: LogPosition, read_ahead: usize) -> Result<Self, LogError> {
        let mut channel = LogFileChannel::open(files, from.log_version, read_ahead)?;
        channel.set_position(from.byte_offset)?;
        Ok(Self {
            files: files.clone(),
            position: channel.log_position(),
            channel: Some(channel),
            read_ahead,
            current: None,
        })
    }

    /// Start at the first entry of the lowest version present.
    pub fn from_start(files: &LogFiles, read_ahead: usize) -> Result<Self, LogError> {
        let version = files.lowest_version()?.ok_or(LogError::MissingVersion(0))?;
        Self::open(files, LogPosition::start_of(version), read_ahead)
    }

    fn is_last_version(&self, version: u64) -> bool {
        !self.files.exists(version + 1)
    }
}

impl CommandBatchCursor for ForwardLogCursor {
    fn next(&mut self) -> Result<bool, LogError> {
        loop {
            let Some(channel) = self.channel.as_mut() else {
                self.current = None;
                return Ok(false);
            };
            let version = channel.version();
            match read_batch(channel) {
                Ok(Some(batch)) => {
                    self.position = batch.end;
                    self.current = Some(batch);
                    return Ok(true);
                }
                Ok(None) if self.is_last_version(version) => {
                    self.current = None;
                    return Ok(false);
                }
                Ok(None) => {
                    let next = LogFileChannel::open(&self.files, version + 1, self.read_ahead)?;
                    self.position = next.log_position();
                    self.channel = Some(next);
                }
                Err(e) if e.is_torn_tail() && self.is_last_version(version) => {
                    self.current = None;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn get(&self) -> Option<&LoggedBatch> {
        self.current.as_ref()
    }

    fn position(&self) -> LogPosition {
        self.position
    }

    fn close(&mut self) -> Result<(), LogError> {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.current = None;
        Ok(())
    }
}
