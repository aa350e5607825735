//! Appending batches to the newest log version.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::txlog::{
    CommandBatch, HEADER_SIZE, LogError, LogFileChannel, LogFiles, LogHeader, LogPosition,
    ReadableLogChannel, Terminator, TransactionMetadata, TransactionMetadataCache, read_batch,
};

/// Where an appended batch landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedBatch {
    /// Position of the `Start` entry.
    pub start_position: LogPosition,
    /// Position of the terminator entry.
    pub commit_position: LogPosition,
    /// Position right after the batch.
    pub end_position: LogPosition,
}

/// Single writer of the transaction log.
///
/// # Invariants
///
/// - `offset` is the end of the last complete batch in `version`
/// - Batches never span versions
#[derive(Debug)]
pub struct LogAppender {
    files: LogFiles,
    file: File,
    version: u64,
    offset: u64,
    rotation_threshold: u64,
    last_tx_id: u64,
    /// Start positions of transactions whose first chunks are written but
    /// which have not committed yet.
    open_chunked: HashMap<u64, LogPosition>,
    metadata: Option<Arc<TransactionMetadataCache>>,
}

impl LogAppender {
    /// Open the newest version for appending, creating version 0 in an empty
    /// directory. A torn batch at the end of the newest version is cut off.
    pub fn open(files: &LogFiles, config: &EngineConfig) -> Result<Self, LogError> {
        let Some(version) = files.highest_version()? else {
            let file = files.create(LogHeader {
                log_version: 0,
                previous_last_tx_id: 0,
            })?;
            info!(version = 0, "created transaction log");
            return Ok(Self::new(files, file, 0, HEADER_SIZE, 0, config));
        };

        let mut channel = LogFileChannel::open(files, version, config.log_read_ahead)?;
        let mut last_tx_id = channel.header().previous_last_tx_id;
        let mut end = HEADER_SIZE;
        loop {
            match read_batch(&mut channel) {
                Ok(Some(logged)) => {
                    end = logged.end.byte_offset;
                    if logged.batch.terminator == Terminator::Commit {
                        last_tx_id = last_tx_id.max(logged.batch.tx_id);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(version, offset = end, error = %e, "cutting off damaged log tail");
                    break;
                }
            }
        }
        channel.close();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(files.path_for(version))?;
        file.set_len(end)?;
        file.seek(SeekFrom::Start(end))?;
        info!(version, offset = end, last_tx_id, "opened transaction log");
        Ok(Self::new(files, file, version, end, last_tx_id, config))
    }

    fn new(
        files: &LogFiles,
        file: File,
        version: u64,
        offset: u64,
        last_tx_id: u64,
        config: &EngineConfig,
    ) -> Self {
        Self {
            files: files.clone(),
            file,
            version,
            offset,
            rotation_threshold: config.log_rotation_threshold,
            last_tx_id,
            open_chunked: HashMap::new(),
            metadata: None,
        }
    }

    /// Record the start of every committed transaction in `cache`.
    #[must_use]
    pub fn with_metadata_cache(mut self, cache: Arc<TransactionMetadataCache>) -> Self {
        self.metadata = Some(cache);
        self
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Highest committed transaction id in the log.
    #[must_use]
    pub const fn last_tx_id(&self) -> u64 {
        self.last_tx_id
    }

    #[must_use]
    pub const fn position(&self) -> LogPosition {
        LogPosition::new(self.version, self.offset)
    }

    /// Write `batch`, rotating first if the current version is full.
    ///
    /// The batch is written but not synced; call `force()` for durability.
    pub fn append(&mut self, batch: &CommandBatch) -> Result<AppendedBatch, LogError> {
        if self.offset >= self.rotation_threshold {
            self.rotate()?;
        }

        let entries = batch.entries();
        let mut bytes = Vec::new();
        let mut terminator_offset = 0;
        for (i, entry) in entries.iter().enumerate() {
            if i + 1 == entries.len() {
                terminator_offset = bytes.len() as u64;
            }
            bytes.extend_from_slice(&entry.to_bytes());
        }
        self.file.write_all(&bytes)?;

        let start_position = self.position();
        self.offset += bytes.len() as u64;
        let appended = AppendedBatch {
            start_position,
            commit_position: LogPosition::new(self.version, start_position.byte_offset + terminator_offset),
            end_position: self.position(),
        };
        self.track(batch, start_position);
        Ok(appended)
    }

    fn track(&mut self, batch: &CommandBatch, start: LogPosition) {
        match batch.terminator {
            Terminator::ChunkEnd => {
                self.open_chunked.entry(batch.tx_id).or_insert(start);
            }
            Terminator::Rollback => {
                self.open_chunked.remove(&batch.tx_id);
            }
            Terminator::Commit => {
                let start = self.open_chunked.remove(&batch.tx_id).unwrap_or(start);
                self.last_tx_id = self.last_tx_id.max(batch.tx_id);
                if let Some(cache) = &self.metadata {
                    cache.put(TransactionMetadata {
                        tx_id: batch.tx_id,
                        start_position: start,
                        time_millis: batch.time_millis,
                    });
                }
            }
        }
    }

    /// Sync appended batches to disk.
    pub fn force(&mut self) -> Result<(), LogError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Start a new version. Later batches go to it.
    pub fn rotate(&mut self) -> Result<u64, LogError> {
        self.file.sync_all()?;
        let next = self.version + 1;
        self.file = self.files.create(LogHeader {
            log_version: next,
            previous_last_tx_id: self.last_tx_id,
        })?;
        info!(from = self.version, to = next, last_tx_id = self.last_tx_id, "rotated transaction log");
        self.version = next;
        self.offset = HEADER_SIZE;
        Ok(next)
    }
}
