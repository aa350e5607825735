//! Log file naming and headers.
//!
//! # Header Format
//!
//! ```text
//! +----------+---------------------------------------------------+
//! | 0-7      | magic "TXLOG\0\0\x01"                             |
//! | 8-15     | log_version                                       |
//! | 16-23    | last_tx_id committed before this file was created |
//! +----------+---------------------------------------------------+
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::txlog::LogError;

/// Bytes before the first entry of every log file.
pub const HEADER_SIZE: u64 = 24;

const MAGIC: [u8; 8] = *b"TXLOG\0\0\x01";

const FILE_PREFIX: &str = "txlog.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub log_version: u64,
    /// Highest transaction id committed in earlier versions.
    pub previous_last_tx_id: u64,
}

impl LogHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut bytes = [0u8; 24];
        bytes[..8].copy_from_slice(&MAGIC);
        bytes[8..16].copy_from_slice(&self.log_version.to_le_bytes());
        bytes[16..].copy_from_slice(&self.previous_last_tx_id.to_le_bytes());
        bytes
    }

    /// Decode a header, checking it belongs to `expected_version`.
    pub fn from_bytes(bytes: &[u8; 24], expected_version: u64) -> Result<Self, LogError> {
        let invalid = LogError::InvalidHeader {
            version: expected_version,
        };
        if bytes[..8] != MAGIC {
            return Err(invalid);
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[8..16]);
        let log_version = u64::from_le_bytes(word);
        word.copy_from_slice(&bytes[16..]);
        if log_version != expected_version {
            return Err(invalid);
        }
        Ok(Self {
            log_version,
            previous_last_tx_id: u64::from_le_bytes(word),
        })
    }
}

/// The set of log files in one directory.
#[derive(Debug, Clone)]
pub struct LogFiles {
    dir: PathBuf,
}

impl LogFiles {
    /// Use `dir` for log files, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{version}"))
    }

    #[must_use]
    pub fn exists(&self, version: u64) -> bool {
        self.path_for(version).is_file()
    }

    /// All present versions, ascending. Unrelated files are ignored.
    pub fn versions(&self) -> Result<Vec<u64>, LogError> {
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let version = name
                .to_str()
                .and_then(|name| name.strip_prefix(FILE_PREFIX))
                .and_then(|suffix| suffix.parse::<u64>().ok());
            if let Some(version) = version {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn lowest_version(&self) -> Result<Option<u64>, LogError> {
        Ok(self.versions()?.first().copied())
    }

    pub fn highest_version(&self) -> Result<Option<u64>, LogError> {
        Ok(self.versions()?.last().copied())
    }

    /// Create version `version` with its header written and synced.
    pub fn create(&self, header: LogHeader) -> Result<File, LogError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.path_for(header.log_version))?;
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;
        Ok(file)
    }

    /// Open version `version` for reading and validate its header.
    pub fn open_for_read(&self, version: u64) -> Result<(File, LogHeader), LogError> {
        let mut file = match File::open(self.path_for(version)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LogError::MissingVersion(version));
            }
            Err(e) => return Err(e.into()),
        };
        let header = read_header(&mut file, version)?;
        Ok((file, header))
    }

    pub fn header(&self, version: u64) -> Result<LogHeader, LogError> {
        self.open_for_read(version).map(|(_, header)| header)
    }
}

fn read_header(file: &mut File, version: u64) -> Result<LogHeader, LogError> {
    let mut bytes = [0u8; 24];
    match file.read_exact(&mut bytes) {
        Ok(()) => LogHeader::from_bytes(&bytes, version),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(LogError::InvalidHeader { version })
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        for version in [3, 0, 12] {
            files
                .create(LogHeader {
                    log_version: version,
                    previous_last_tx_id: version * 10,
                })
                .unwrap();
        }
        std::fs::write(dir.path().join("txlog.bak"), b"junk").unwrap();
        std::fs::write(dir.path().join("other.1"), b"junk").unwrap();

        assert_eq!(files.versions().unwrap(), vec![0, 3, 12]);
        assert_eq!(files.lowest_version().unwrap(), Some(0));
        assert_eq!(files.highest_version().unwrap(), Some(12));
        assert_eq!(files.header(3).unwrap().previous_last_tx_id, 30);
    }

    #[test]
    fn test_header_must_match_file_version() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        files
            .create(LogHeader {
                log_version: 1,
                previous_last_tx_id: 0,
            })
            .unwrap();
        std::fs::rename(files.path_for(1), files.path_for(2)).unwrap();
        assert!(matches!(files.header(2), Err(LogError::InvalidHeader { version: 2 })));
        assert!(matches!(files.header(7), Err(LogError::MissingVersion(7))));
    }

    #[test]
    fn test_short_file_has_invalid_header() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        std::fs::write(files.path_for(0), b"TXLOG").unwrap();
        assert!(matches!(files.header(0), Err(LogError::InvalidHeader { version: 0 })));
    }
}
