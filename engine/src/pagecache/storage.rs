//! Storage abstraction underneath the page cache.
//!
//! The cache talks to files through the `Storage` trait so that real file
//! I/O can be swapped for simulated storage with fault injection in tests.
//!
//! # Design
//!
//! - Page-granular positional reads and writes (`pread`/`pwrite`), so one
//!   storage handle serves many threads without a seek lock
//! - Reads past the end of the file yield zeroed pages; the cache decides
//!   where the logical end of a paged file is

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::pagecache::PageId;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Injected fault for simulation.
    InjectedFault(String),
    /// A buffer did not match the storage page size.
    BadBufferSize { expected: usize, actual: usize },
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::BadBufferSize { expected, actual } => {
                write!(f, "buffer of {actual} bytes, page size is {expected}")
            }
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over page-based file storage.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read_page` returns the last written content for a page, or zeros for a
///   page never written
/// - `sync` makes all previous writes durable
/// - all methods are callable concurrently from several threads
pub trait Storage: Send + Sync {
    /// Page size this storage was opened with.
    fn page_size(&self) -> usize;

    /// Read page `page_id` into `buf`, which must be exactly one page long.
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write one page. The write may be buffered until `sync` is called.
    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<(), StorageError>;

    /// Number of whole pages currently stored.
    fn page_count(&self) -> Result<u64, StorageError>;

    /// Sync all pending writes to durable storage.
    fn sync(&self) -> Result<(), StorageError>;
}

/// File-backed storage.
pub struct FileStorage {
    file: File,
    path: PathBuf,
    page_size: usize,
}

impl FileStorage {
    /// Open `path`, creating it when `create` is set.
    pub fn open(path: &Path, page_size: usize, create: bool) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_len(&self, len: usize) -> Result<(), StorageError> {
        if len == self.page_size {
            Ok(())
        } else {
            Err(StorageError::BadBufferSize {
                expected: self.page_size,
                actual: len,
            })
        }
    }

    fn offset_of(&self, page_id: PageId) -> u64 {
        page_id * self.page_size as u64
    }
}

impl Storage for FileStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_len(buf.len())?;
        let mut filled = 0;
        while filled < buf.len() {
            let read = self
                .file
                .read_at(&mut buf[filled..], self.offset_of(page_id) + filled as u64)?;
            if read == 0 {
                // Past the end of the file: the rest of the page was never written.
                buf[filled..].fill(0);
                break;
            }
            filled += read;
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<(), StorageError> {
        self.check_len(buf.len())?;
        self.file.write_all_at(buf, self.offset_of(page_id))?;
        Ok(())
    }

    fn page_count(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len() / self.page_size as u64)
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(&dir.path().join("pages"), 256, true).unwrap();
        assert_eq!(storage.page_count().unwrap(), 0);

        let page = vec![0xAB; 256];
        storage.write_page(3, &page).unwrap();
        assert_eq!(storage.page_count().unwrap(), 4);

        let mut buf = vec![0; 256];
        storage.read_page(3, &mut buf).unwrap();
        assert_eq!(buf, page);
    }

    #[test]
    fn test_read_past_end_is_zeroed() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(&dir.path().join("pages"), 256, true).unwrap();
        let mut buf = vec![0xFF; 256];
        storage.read_page(10, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_wrong_buffer_size_is_rejected() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(&dir.path().join("pages"), 256, true).unwrap();
        let result = storage.write_page(0, &[0; 100]);
        assert!(matches!(
            result,
            Err(StorageError::BadBufferSize {
                expected: 256,
                actual: 100
            })
        ));
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let result = FileStorage::open(&dir.path().join("missing"), 256, false);
        assert!(matches!(result, Err(StorageError::Io(_))));
    }
}
