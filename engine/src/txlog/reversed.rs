//! Reading the log backwards.
//!
//! Entries can only be decoded front to back, so a reversed cursor first
//! sketches a file: one forward pass recording where each batch starts. It
//! then replays the sketch from the end in chunks that fit the channel's
//! read-ahead window, reading each chunk forward and handing its batches out
//! last to first.

use std::sync::Arc;

use tracing::warn;

use crate::config::EngineConfig;
use crate::txlog::{
    CommandBatchCursor, LogError, LogFileChannel, LogFiles, LogPosition, LoggedBatch,
    ReadableLogChannel, read_batch,
};

/// Told about damage a reversed cursor skipped instead of failing on.
pub trait ReversedCursorMonitor: Send + Sync {
    fn corrupted_log_file(&self, version: u64, offset: u64, error: &LogError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Replaying,
    Exhausted,
    Closed,
}

const INITIAL_SKETCH_CAPACITY: usize = 64;

/// Reversed cursor over the batches of one log version, from the channel's
/// position at construction to the end of the file.
///
/// # Invariants
///
/// - `offsets` is strictly ascending
/// - `offsets[..remaining]` are the batches not yet handed out
/// - The channel never leaves `version`
pub struct ReversedSingleFileCursor<C: ReadableLogChannel> {
    channel: C,
    version: u64,
    offsets: Vec<u64>,
    sketch_start: u64,
    sketch_end: u64,
    remaining: usize,
    chunk: Vec<LoggedBatch>,
    current: Option<LoggedBatch>,
    state: State,
}

impl<C: ReadableLogChannel> ReversedSingleFileCursor<C> {
    /// Sketch the rest of the channel's file, the newest log version.
    ///
    /// Damage stops the sketch. With `fail_on_corrupted_log_files` it is
    /// returned as an error; otherwise it is reported to `monitor`, logged,
    /// and everything before it is replayed. A torn tail is where a crash
    /// stopped the writer and is never an error here.
    pub fn open(
        channel: C,
        fail_on_corrupted_log_files: bool,
        monitor: Option<&dyn ReversedCursorMonitor>,
    ) -> Result<Self, LogError> {
        Self::sketch(channel, false, fail_on_corrupted_log_files, monitor)
    }

    /// Sketch the rest of a version that has been rotated away from.
    ///
    /// Its writer moved on to a newer version, so a torn tail is damage and
    /// goes through the same policy as any other.
    pub fn open_sealed(
        channel: C,
        fail_on_corrupted_log_files: bool,
        monitor: Option<&dyn ReversedCursorMonitor>,
    ) -> Result<Self, LogError> {
        Self::sketch(channel, true, fail_on_corrupted_log_files, monitor)
    }

    fn sketch(
        mut channel: C,
        sealed: bool,
        fail_on_corrupted_log_files: bool,
        monitor: Option<&dyn ReversedCursorMonitor>,
    ) -> Result<Self, LogError> {
        let version = channel.version();
        let sketch_start = channel.position();
        let mut offsets = Vec::with_capacity(INITIAL_SKETCH_CAPACITY);
        let mut sketch_end = sketch_start;
        loop {
            let before = channel.position();
            match read_batch(&mut channel) {
                Ok(Some(logged)) => {
                    check_version(&channel, version)?;
                    offsets.push(before);
                    sketch_end = logged.end.byte_offset;
                }
                Ok(None) => break,
                Err(e) if e.is_torn_tail() && !sealed => break,
                Err(e) if fail_on_corrupted_log_files => return Err(e),
                Err(e) => {
                    warn!(version, offset = before, sealed, error = %e, "reversed scan stopped at damaged log entry");
                    if let Some(monitor) = monitor {
                        monitor.corrupted_log_file(version, before, &e);
                    }
                    break;
                }
            }
        }
        Ok(Self {
            channel,
            version,
            remaining: offsets.len(),
            offsets,
            sketch_start,
            sketch_end,
            chunk: Vec::new(),
            current: None,
            state: State::Replaying,
        })
    }

    /// Batch start offsets found by the sketch, ascending.
    #[must_use]
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Read the next chunk of sketched batches, ending where the previous
    /// chunk began.
    fn load_chunk(&mut self) -> Result<bool, LogError> {
        if self.remaining == 0 {
            return Ok(false);
        }
        let end = self.remaining;
        let end_offset = self.offsets.get(end).copied().unwrap_or(self.sketch_end);
        let budget = self.channel.read_ahead() as u64;
        let mut start = end - 1;
        while start > 0 && end_offset - self.offsets[start - 1] <= budget {
            start -= 1;
        }

        self.channel.set_position(self.offsets[start])?;
        let mut chunk = Vec::with_capacity(end - start);
        for &offset in &self.offsets[start..end] {
            let logged = read_batch(&mut self.channel)?.ok_or(LogError::Incomplete { offset })?;
            check_version(&self.channel, self.version)?;
            if logged.start.byte_offset != offset {
                return Err(LogError::CorruptEntry(format!(
                    "log version {} changed since it was sketched",
                    self.version
                )));
            }
            chunk.push(logged);
        }
        self.remaining = start;
        self.chunk = chunk;
        Ok(true)
    }
}

fn check_version<C: ReadableLogChannel + ?Sized>(channel: &C, expected: u64) -> Result<(), LogError> {
    let found = channel.version();
    if found == expected {
        Ok(())
    } else {
        Err(LogError::VersionCrossed { expected, found })
    }
}

impl<C: ReadableLogChannel> CommandBatchCursor for ReversedSingleFileCursor<C> {
    fn next(&mut self) -> Result<bool, LogError> {
        if self.state != State::Replaying {
            return Ok(false);
        }
        if self.chunk.is_empty() && !self.load_chunk()? {
            self.state = State::Exhausted;
            self.current = None;
            return Ok(false);
        }
        self.current = self.chunk.pop();
        Ok(self.current.is_some())
    }

    fn get(&self) -> Option<&LoggedBatch> {
        self.current.as_ref()
    }

    /// Start of the current batch; the end of the sketched region before the
    /// first `next()`, its start once exhausted.
    fn position(&self) -> LogPosition {
        let offset = match (&self.current, self.state) {
            (Some(logged), _) => logged.start.byte_offset,
            (None, State::Exhausted | State::Closed) => self.sketch_start,
            (None, State::Replaying) => self.sketch_end,
        };
        LogPosition::new(self.version, offset)
    }

    fn close(&mut self) -> Result<(), LogError> {
        if self.state != State::Closed {
            self.state = State::Closed;
            self.chunk.clear();
            self.current = None;
            self.channel.close();
        }
        Ok(())
    }
}

/// Reversed cursor from the end of the newest version back to a start
/// position.
pub struct ReversedMultiFileCursor {
    files: LogFiles,
    start: LogPosition,
    read_ahead: usize,
    fail_on_corrupted_log_files: bool,
    monitor: Option<Arc<dyn ReversedCursorMonitor>>,
    /// Newest version when the cursor opened; every older one is sealed.
    highest: u64,
    /// Version to open once the current one is done.
    next_version: Option<u64>,
    current: Option<ReversedSingleFileCursor<LogFileChannel>>,
    position: LogPosition,
}

impl ReversedMultiFileCursor {
    /// Yield every batch at or after `start`, newest first.
    pub fn open(
        files: &LogFiles,
        start: LogPosition,
        config: &EngineConfig,
        monitor: Option<Arc<dyn ReversedCursorMonitor>>,
    ) -> Result<Self, LogError> {
        let highest = files
            .highest_version()?
            .filter(|&highest| highest >= start.log_version)
            .ok_or(LogError::MissingVersion(start.log_version))?;
        Ok(Self {
            files: files.clone(),
            start,
            read_ahead: config.log_read_ahead,
            fail_on_corrupted_log_files: config.fail_on_corrupted_log_files,
            monitor,
            highest,
            next_version: Some(highest),
            current: None,
            position: LogPosition::start_of(highest),
        })
    }

    fn open_version(&self, version: u64) -> Result<ReversedSingleFileCursor<LogFileChannel>, LogError> {
        let mut channel = LogFileChannel::open(&self.files, version, self.read_ahead)?;
        if version == self.start.log_version {
            channel.set_position(self.start.byte_offset)?;
        }
        let monitor = self.monitor.as_deref();
        if version == self.highest {
            ReversedSingleFileCursor::open(channel, self.fail_on_corrupted_log_files, monitor)
        } else {
            ReversedSingleFileCursor::open_sealed(channel, self.fail_on_corrupted_log_files, monitor)
        }
    }
}

impl CommandBatchCursor for ReversedMultiFileCursor {
    fn next(&mut self) -> Result<bool, LogError> {
        loop {
            if let Some(cursor) = self.current.as_mut() {
                if cursor.next()? {
                    self.position = cursor.position();
                    return Ok(true);
                }
                cursor.close()?;
                self.current = None;
            }
            let Some(version) = self.next_version else {
                return Ok(false);
            };
            self.next_version = version
                .checked_sub(1)
                .filter(|&lower| lower >= self.start.log_version);
            self.current = Some(self.open_version(version)?);
        }
    }

    fn get(&self) -> Option<&LoggedBatch> {
        self.current.as_ref().and_then(CommandBatchCursor::get)
    }

    fn position(&self) -> LogPosition {
        self.position
    }

    fn close(&mut self) -> Result<(), LogError> {
        self.next_version = None;
        if let Some(mut cursor) = self.current.take() {
            cursor.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use parking_lot::Mutex;

    use super::*;
    use crate::kernel::StorageCommand;
    use crate::txlog::{CommandBatch, ForwardLogCursor, LogAppender, LogEntry, LogHeader};

    fn batch(tx_id: u64, commands: u64) -> CommandBatch {
        CommandBatch::committed(
            tx_id,
            tx_id,
            (0..commands)
                .map(|entity| StorageCommand::TokenAdded {
                    entity,
                    token: u32::try_from(tx_id).unwrap(),
                })
                .collect(),
        )
    }

    fn write_log(files: &LogFiles, batches: &[CommandBatch]) {
        let mut appender = LogAppender::open(files, &EngineConfig::default()).unwrap();
        for batch in batches {
            appender.append(batch).unwrap();
        }
        appender.force().unwrap();
    }

    fn ids(cursor: &mut impl CommandBatchCursor) -> Vec<u64> {
        let mut ids = Vec::new();
        while cursor.next().unwrap() {
            ids.push(cursor.get().unwrap().batch.tx_id);
        }
        ids
    }

    #[derive(Default)]
    struct RecordingMonitor {
        reports: Mutex<Vec<(u64, u64)>>,
    }

    impl ReversedCursorMonitor for RecordingMonitor {
        fn corrupted_log_file(&self, version: u64, offset: u64, _error: &LogError) {
            self.reports.lock().push((version, offset));
        }
    }

    #[test]
    fn test_reverse_is_exact_reverse_of_forward() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        let batches: Vec<CommandBatch> = (1..=40).map(|tx_id| batch(tx_id, tx_id % 5)).collect();
        write_log(&files, &batches);

        let mut forward = ForwardLogCursor::from_start(&files, 4096).unwrap();
        let mut forward_ids = ids(&mut forward);

        // Small read-ahead forces many chunks.
        let channel = LogFileChannel::open(&files, 0, 150).unwrap();
        let mut reversed = ReversedSingleFileCursor::open(channel, true, None).unwrap();
        let reversed_ids = ids(&mut reversed);

        forward_ids.reverse();
        assert_eq!(reversed_ids, forward_ids);
        assert_eq!(reversed.position(), LogPosition::start_of(0));
    }

    #[test]
    fn test_sketch_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        write_log(&files, &(1..=10).map(|tx_id| batch(tx_id, 2)).collect::<Vec<_>>());

        let sketch = || {
            let channel = LogFileChannel::open(&files, 0, 64).unwrap();
            ReversedSingleFileCursor::open(channel, true, None)
                .unwrap()
                .offsets()
                .to_vec()
        };
        let first = sketch();
        assert_eq!(first.len(), 10);
        assert_eq!(first, sketch());
        assert!(first.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_corruption_policy() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        write_log(&files, &(1..=3).map(|tx_id| batch(tx_id, 1)).collect::<Vec<_>>());
        let damaged_at = {
            let channel = LogFileChannel::open(&files, 0, 64).unwrap();
            ReversedSingleFileCursor::open(channel, true, None).unwrap().offsets()[2]
        };
        let mut bytes = std::fs::read(files.path_for(0)).unwrap();
        bytes[usize::try_from(damaged_at).unwrap() + 6] ^= 0xff;
        std::fs::write(files.path_for(0), &bytes).unwrap();

        let channel = LogFileChannel::open(&files, 0, 64).unwrap();
        assert!(matches!(
            ReversedSingleFileCursor::open(channel, true, None),
            Err(LogError::ChecksumMismatch { .. })
        ));

        let monitor = RecordingMonitor::default();
        let channel = LogFileChannel::open(&files, 0, 64).unwrap();
        let mut cursor = ReversedSingleFileCursor::open(channel, false, Some(&monitor)).unwrap();
        assert_eq!(ids(&mut cursor), vec![2, 1]);
        assert_eq!(*monitor.reports.lock(), vec![(0, damaged_at)]);
    }

    /// Serves a byte image but claims a different version after a number of
    /// reads, as a channel that silently advanced to the next file would.
    struct DriftingChannel {
        bytes: Vec<u8>,
        position: u64,
        reads: usize,
        drift_after: usize,
    }

    impl ReadableLogChannel for DriftingChannel {
        fn version(&self) -> u64 {
            u64::from(self.reads > self.drift_after)
        }

        fn position(&self) -> u64 {
            self.position
        }

        fn set_position(&mut self, offset: u64) -> Result<(), LogError> {
            self.position = offset;
            Ok(())
        }

        fn read_ahead(&self) -> usize {
            1 << 16
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, LogError> {
            self.reads += 1;
            let start = usize::try_from(self.position).unwrap().min(self.bytes.len());
            let n = buf.len().min(self.bytes.len() - start);
            buf[..n].copy_from_slice(&self.bytes[start..start + n]);
            self.position += n as u64;
            Ok(n)
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_channel_crossing_versions_fails_loudly() {
        let mut bytes = Vec::new();
        for tx_id in 1..=4 {
            for entry in batch(tx_id, 1).entries() {
                bytes.extend_from_slice(&entry.to_bytes());
            }
        }
        let channel = DriftingChannel {
            bytes,
            position: 0,
            reads: 0,
            drift_after: 9,
        };
        assert!(matches!(
            ReversedSingleFileCursor::open(channel, false, None),
            Err(LogError::VersionCrossed { expected: 0, found: 1 })
        ));
    }

    #[test]
    fn test_multi_file_stops_at_start_position() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        let config = EngineConfig {
            log_rotation_threshold: 300,
            log_read_ahead: 128,
            ..EngineConfig::default()
        };
        let mut appender = LogAppender::open(&files, &config).unwrap();
        let mut starts = Vec::new();
        for tx_id in 1..=20 {
            starts.push(appender.append(&batch(tx_id, 2)).unwrap().start_position);
        }
        assert!(files.versions().unwrap().len() > 2);

        let from = starts[6];
        let mut cursor = ReversedMultiFileCursor::open(&files, from, &config, None).unwrap();
        let seen = ids(&mut cursor);
        assert_eq!(seen, (7..=20).rev().collect::<Vec<_>>());
        assert_eq!(cursor.position(), from);
        cursor.close().unwrap();
        cursor.close().unwrap();
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_torn_tail_only_benign_in_newest_version() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        let mut config = EngineConfig {
            log_rotation_threshold: 1 << 20,
            ..EngineConfig::default()
        };
        let mut appender = LogAppender::open(&files, &config).unwrap();
        appender.append(&batch(1, 2)).unwrap();
        let torn = appender.append(&batch(2, 2)).unwrap();
        appender.rotate().unwrap();
        appender.append(&batch(3, 2)).unwrap();
        let newest_torn = appender.append(&batch(4, 2)).unwrap();
        appender.force().unwrap();
        drop(appender);

        let cut = |version: u64, len: u64| {
            std::fs::OpenOptions::new()
                .write(true)
                .open(files.path_for(version))
                .unwrap()
                .set_len(len)
                .unwrap();
        };
        cut(0, torn.end_position.byte_offset - 3);
        cut(1, newest_torn.end_position.byte_offset - 3);

        config.fail_on_corrupted_log_files = true;
        let mut cursor =
            ReversedMultiFileCursor::open(&files, LogPosition::start_of(0), &config, None).unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.get().unwrap().batch.tx_id, 3);
        assert!(matches!(cursor.next(), Err(LogError::Incomplete { .. })));

        config.fail_on_corrupted_log_files = false;
        let monitor = Arc::new(RecordingMonitor::default());
        #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
        let reporter: Arc<dyn ReversedCursorMonitor> = Arc::clone(&monitor) as _;
        let mut cursor =
            ReversedMultiFileCursor::open(&files, LogPosition::start_of(0), &config, Some(reporter)).unwrap();
        assert_eq!(ids(&mut cursor), vec![3, 1]);
        assert_eq!(*monitor.reports.lock(), vec![(0, torn.start_position.byte_offset)]);
    }

    #[test]
    fn test_empty_file_and_missing_version() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        let mut file = files
            .create(LogHeader {
                log_version: 0,
                previous_last_tx_id: 0,
            })
            .unwrap();
        file.write_all(&LogEntry::Start { tx_id: 1, chunk_id: 0, time_millis: 0 }.to_bytes())
            .unwrap();

        let channel = LogFileChannel::open(&files, 0, 64).unwrap();
        let mut cursor = ReversedSingleFileCursor::open(channel, true, None).unwrap();
        assert!(cursor.offsets().is_empty());
        assert!(!cursor.next().unwrap());

        assert!(matches!(
            ReversedMultiFileCursor::open(&files, LogPosition::start_of(3), &EngineConfig::default(), None),
            Err(LogError::MissingVersion(3))
        ));
    }
}
