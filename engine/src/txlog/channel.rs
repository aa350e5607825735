//! Buffered read channels over log files.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::txlog::{HEADER_SIZE, LogEntry, LogError, LogFiles, LogHeader, LogPosition};

/// Sequential reader over the entries of a log file.
///
/// Closing a channel makes every later read fail with `LogError::Closed`.
pub trait ReadableLogChannel {
    /// Version of the file the channel currently reads.
    fn version(&self) -> u64;

    /// Offset of the next byte to read.
    fn position(&self) -> u64;

    fn set_position(&mut self, offset: u64) -> Result<(), LogError>;

    /// Bytes fetched from the file per refill.
    fn read_ahead(&self) -> usize;

    /// Read up to `buf.len()` bytes. Fewer bytes means end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LogError>;

    fn close(&mut self);

    fn log_position(&self) -> LogPosition {
        LogPosition::new(self.version(), self.position())
    }

    /// Read the next entry. `Ok(None)` at a clean end of file; a file ending
    /// inside an entry is `LogError::Truncated`.
    fn read_entry(&mut self) -> Result<Option<LogEntry>, LogError> {
        let offset = self.position();
        let mut header = [0u8; 4];
        match self.read(&mut header)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(LogError::Truncated { offset }),
        }
        let len = LogEntry::frame_len(header)?;
        let mut frame = vec![0u8; len];
        frame[..4].copy_from_slice(&header);
        if self.read(&mut frame[4..])? < len - 4 {
            return Err(LogError::Truncated { offset });
        }
        LogEntry::from_bytes(&frame).map(|(entry, _)| Some(entry))
    }
}

/// A channel over one log version with a read-ahead buffer.
#[derive(Debug)]
pub struct LogFileChannel {
    version: u64,
    header: LogHeader,
    file: Option<File>,
    buffer: Vec<u8>,
    /// File offset of `buffer[0]`.
    buffer_start: u64,
    position: u64,
    read_ahead: usize,
}

impl LogFileChannel {
    /// Open `version`, positioned at its first entry.
    pub fn open(files: &LogFiles, version: u64, read_ahead: usize) -> Result<Self, LogError> {
        let (file, header) = files.open_for_read(version)?;
        Ok(Self {
            version,
            header,
            file: Some(file),
            buffer: Vec::with_capacity(read_ahead),
            buffer_start: HEADER_SIZE,
            position: HEADER_SIZE,
            read_ahead: read_ahead.max(1),
        })
    }

    #[must_use]
    pub const fn header(&self) -> LogHeader {
        self.header
    }

    fn buffered(&self) -> &[u8] {
        let Some(skip) = self.position.checked_sub(self.buffer_start) else {
            return &[];
        };
        usize::try_from(skip)
            .ok()
            .and_then(|skip| self.buffer.get(skip..))
            .unwrap_or(&[])
    }

    /// Replace the buffer with up to `read_ahead` bytes at `position`.
    fn refill(&mut self) -> Result<(), LogError> {
        let file = self.file.as_mut().ok_or(LogError::Closed)?;
        file.seek(SeekFrom::Start(self.position))?;
        self.buffer.resize(self.read_ahead, 0);
        let mut filled = 0;
        while filled < self.buffer.len() {
            match file.read(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.buffer.truncate(filled);
        self.buffer_start = self.position;
        Ok(())
    }
}

impl ReadableLogChannel for LogFileChannel {
    fn version(&self) -> u64 {
        self.version
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, offset: u64) -> Result<(), LogError> {
        if self.file.is_none() {
            return Err(LogError::Closed);
        }
        self.position = offset.max(HEADER_SIZE);
        Ok(())
    }

    fn read_ahead(&self) -> usize {
        self.read_ahead
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LogError> {
        if self.file.is_none() {
            return Err(LogError::Closed);
        }
        let mut copied = 0;
        while copied < buf.len() {
            if self.buffered().is_empty() {
                self.refill()?;
                if self.buffer.is_empty() {
                    break;
                }
            }
            let available = self.buffered();
            let n = available.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&available[..n]);
            copied += n;
            self.position += n as u64;
        }
        Ok(copied)
    }

    fn close(&mut self) {
        self.file = None;
        self.buffer = Vec::new();
    }
}
