//! Page cache.
//!
//! A fixed pool of frames over file-backed storage. Pages are addressed by
//! `(file, page id)` and only reachable through cursors:
//!
//! - read cursors are optimistic: lock-free, validated with `should_retry()`
//! - write cursors are exclusive per page
//!
//! A pre-fetcher thread can be attached to a read cursor to fault pages in
//! ahead of a sequential scan.
//!
//! # Usage
//!
//! ```ignore
//! let cache = PageCache::new(&EngineConfig::default());
//! let file = cache.map(path, true)?;
//!
//! let mut writer = file.write_cursor(0);
//! writer.next()?;
//! writer.put_u64(0, 42);
//! writer.close();
//!
//! let mut reader = file.read_cursor(0);
//! reader.next()?;
//! let value = loop {
//!     let value = reader.get_u64(0);
//!     if !reader.should_retry() {
//!         break value;
//!     }
//! };
//! ```

mod buffer_pool;
mod cache;
mod cursor;
pub mod prefetch;
mod storage;

pub use buffer_pool::BufferPool;
pub use cache::{CacheStats, PageCache, PageCacheError, PagedFile};
pub use cursor::{
    CancellationListener, PageCursor, ReadPageCursor, UNBOUND_PAGE_ID, WritePageCursor,
};
pub use storage::{FileStorage, Storage, StorageError};

/// Page number within one file.
pub type PageId = u64;

/// Identifier of a file mapping inside one page cache.
pub type FileId = u32;
