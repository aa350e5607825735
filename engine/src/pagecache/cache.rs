//! The page cache proper: page table, faulting and eviction.
//!
//! # Design
//!
//! - One page table maps `(file, page)` to a frame index. It sits behind a
//!   single mutex; faults and evictions are serialized by it, hits only hold
//!   it long enough to pin
//! - Eviction is a clock sweep: pinned frames are skipped, referenced frames
//!   get a second chance, dirty victims are written back before reuse
//! - A failed read releases its frame again, so an I/O error on one page
//!   never poisons the cache for other pages
//!
//! # Invariants
//!
//! - A frame is reachable from the page table iff its binding is `Some`
//! - Pinned frames are never evicted
//! - Lock order is page table, then file registry

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::pagecache::buffer_pool::{BufferPool, Frame};
use crate::pagecache::cursor::{ReadPageCursor, WritePageCursor};
use crate::pagecache::storage::{FileStorage, Storage, StorageError};
use crate::pagecache::{FileId, PageId};

/// Errors surfaced by the page cache and its cursors.
#[derive(Debug)]
pub enum PageCacheError {
    /// The backing storage failed.
    Storage(StorageError),
    /// Every frame is pinned; nothing can be evicted.
    CacheExhausted,
    /// A file cannot be unmapped while cursors still pin its pages.
    FileInUse { file_id: FileId, pinned: usize },
    /// Storage page size differs from the cache page size.
    PageSizeMismatch { expected: usize, actual: usize },
    /// The file was unmapped.
    FileClosed { file_id: FileId },
}

impl std::fmt::Display for PageCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::CacheExhausted => write!(f, "page cache exhausted: all frames pinned"),
            Self::FileInUse { file_id, pinned } => {
                write!(f, "file {file_id} still has {pinned} pinned pages")
            }
            Self::PageSizeMismatch { expected, actual } => {
                write!(f, "page size mismatch: cache uses {expected}, storage uses {actual}")
            }
            Self::FileClosed { file_id } => write!(f, "file {file_id} is unmapped"),
        }
    }
}

impl std::error::Error for PageCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for PageCacheError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Counters describing cache behaviour since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Pins served from a resident frame.
    pub hits: u64,
    /// Pins that had to read the page from storage.
    pub faults: u64,
    /// Frames reclaimed by the clock sweep.
    pub evictions: u64,
    /// Dirty pages written back, by eviction or flush.
    pub flushes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    faults: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

type PageKey = (FileId, PageId);

struct PageTable {
    map: HashMap<PageKey, usize>,
    bindings: Vec<Option<PageKey>>,
    clock_hand: usize,
}

/// A fixed pool of frames shared by all mapped files.
pub struct PageCache {
    pool: BufferPool,
    table: Mutex<PageTable>,
    files: RwLock<HashMap<FileId, Arc<dyn Storage>>>,
    next_file_id: AtomicU32,
    counters: Counters,
}

impl PageCache {
    /// Create a cache sized by `config`.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Arc<Self> {
        Self::with_capacity(config.cache_pages, config.page_size)
    }

    /// Create a cache of `pages` frames of `page_size` bytes.
    ///
    /// # Panics
    /// Panics if `pages` is 0 or `page_size` is not a multiple of 8.
    #[must_use]
    pub fn with_capacity(pages: usize, page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            pool: BufferPool::new(pages, page_size),
            table: Mutex::new(PageTable {
                map: HashMap::with_capacity(pages),
                bindings: vec![None; pages],
                clock_hand: 0,
            }),
            files: RwLock::new(HashMap::new()),
            next_file_id: AtomicU32::new(1),
            counters: Counters::default(),
        })
    }

    /// Map a file on disk, creating it when `create` is set.
    pub fn map(self: &Arc<Self>, path: &Path, create: bool) -> Result<PagedFile, PageCacheError> {
        let storage = FileStorage::open(path, self.page_size(), create)?;
        self.map_storage(Arc::new(storage))
    }

    /// Map arbitrary storage.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn map_storage(
        self: &Arc<Self>,
        storage: Arc<dyn Storage>,
    ) -> Result<PagedFile, PageCacheError> {
        if storage.page_size() != self.page_size() {
            return Err(PageCacheError::PageSizeMismatch {
                expected: self.page_size(),
                actual: storage.page_size(),
            });
        }
        let page_count = storage.page_count()?;
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        self.files.write().insert(file_id, Arc::clone(&storage));
        Ok(PagedFile {
            inner: Arc::new(FileHandle {
                file_id,
                cache: Arc::clone(self),
                storage,
                page_count: AtomicU64::new(page_count),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Size of every page in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.pool.page_size()
    }

    /// Total number of frames.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn frame(&self, index: usize) -> &Frame {
        self.pool.frame(index)
    }

    /// Pin `page_id` of `file_id`, faulting it in when not resident.
    ///
    /// # Post-conditions
    /// - On success the returned frame holds the page and is pinned once
    /// - On failure no frame is pinned or bound for the page
    fn pin(
        &self,
        file_id: FileId,
        storage: &dyn Storage,
        page_id: PageId,
    ) -> Result<usize, PageCacheError> {
        let mut table = self.table.lock();
        if let Some(&index) = table.map.get(&(file_id, page_id)) {
            self.pool.frame(index).pin();
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(index);
        }

        let index = self.obtain_frame(&mut table)?;
        let mut buf = vec![0u8; self.page_size()];
        if let Err(e) = storage.read_page(page_id, &mut buf) {
            self.pool.return_frame(index);
            return Err(e.into());
        }

        let frame = self.pool.frame(index);
        frame.load(&buf);
        frame.pin();
        table.map.insert((file_id, page_id), index);
        table.bindings[index] = Some((file_id, page_id));
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        Ok(index)
    }

    fn unpin(&self, index: usize) {
        self.pool.frame(index).unpin();
    }

    /// Lease a free frame or evict one with the clock sweep.
    fn obtain_frame(&self, table: &mut PageTable) -> Result<usize, PageCacheError> {
        if let Some(index) = self.pool.lease() {
            return Ok(index);
        }

        // Two full sweeps: the first may only clear reference bits.
        for _ in 0..self.capacity() * 2 {
            let index = table.clock_hand;
            table.clock_hand = (table.clock_hand + 1) % self.capacity();

            let Some(key) = table.bindings[index] else {
                continue;
            };
            let frame = self.pool.frame(index);
            if frame.is_pinned() || frame.take_reference() {
                continue;
            }
            if frame.is_dirty() {
                self.write_back(key, frame)?;
            }
            table.map.remove(&key);
            table.bindings[index] = None;
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            return Ok(index);
        }

        Err(PageCacheError::CacheExhausted)
    }

    fn write_back(&self, (file_id, page_id): PageKey, frame: &Frame) -> Result<(), PageCacheError> {
        let storage = self
            .files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or(PageCacheError::FileClosed { file_id })?;
        let mut buf = vec![0u8; self.page_size()];
        frame.snapshot_for_flush(&mut buf);
        storage.write_page(page_id, &buf)?;
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write every dirty page of `file_id` back and sync the storage.
    fn flush_file(&self, file_id: FileId, storage: &dyn Storage) -> Result<(), PageCacheError> {
        let table = self.table.lock();
        let mut buf = vec![0u8; self.page_size()];
        for (&(owner, page_id), &index) in &table.map {
            if owner != file_id {
                continue;
            }
            let frame = self.pool.frame(index);
            if frame.is_dirty() {
                frame.snapshot_for_flush(&mut buf);
                storage.write_page(page_id, &buf)?;
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(table);
        storage.sync()?;
        Ok(())
    }

    /// Flush and drop every frame of `file_id`, then forget the file.
    fn unmap(&self, file_id: FileId, storage: &dyn Storage) -> Result<(), PageCacheError> {
        let mut table = self.table.lock();
        let owned: Vec<(PageKey, usize)> = table
            .map
            .iter()
            .filter(|((owner, _), _)| *owner == file_id)
            .map(|(key, index)| (*key, *index))
            .collect();

        let pinned = owned
            .iter()
            .filter(|(_, index)| self.pool.frame(*index).is_pinned())
            .count();
        if pinned > 0 {
            return Err(PageCacheError::FileInUse { file_id, pinned });
        }

        let mut buf = vec![0u8; self.page_size()];
        for ((_, page_id), index) in &owned {
            let frame = self.pool.frame(*index);
            if frame.is_dirty() {
                frame.snapshot_for_flush(&mut buf);
                storage.write_page(*page_id, &buf)?;
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
            }
        }
        for (key, index) in owned {
            table.map.remove(&key);
            table.bindings[index] = None;
            self.pool.return_frame(index);
        }
        self.files.write().remove(&file_id);
        drop(table);
        storage.sync()?;
        Ok(())
    }
}

struct FileHandle {
    file_id: FileId,
    cache: Arc<PageCache>,
    storage: Arc<dyn Storage>,
    page_count: AtomicU64,
    closed: AtomicBool,
}

/// A file mapped into the page cache. Cheap to clone; clones share the mapping.
#[derive(Clone)]
pub struct PagedFile {
    inner: Arc<FileHandle>,
}

impl PagedFile {
    /// Open a read cursor whose first `next()` binds `start_page`.
    #[must_use]
    pub fn read_cursor(&self, start_page: PageId) -> ReadPageCursor {
        ReadPageCursor::new(self.clone(), start_page)
    }

    /// Open a write cursor whose first `next()` binds `start_page`.
    #[must_use]
    pub fn write_cursor(&self, start_page: PageId) -> WritePageCursor {
        WritePageCursor::new(self.clone(), start_page)
    }

    /// Identifier of this mapping inside its cache.
    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.inner.file_id
    }

    /// Size of every page in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.inner.cache.page_size()
    }

    /// Number of pages in the file, including pages only written to cache.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.inner.page_count.load(Ordering::Acquire)
    }

    /// Highest page id, or `None` for an empty file.
    #[must_use]
    pub fn last_page_id(&self) -> Option<PageId> {
        self.page_count().checked_sub(1)
    }

    /// The cache this file is mapped into.
    #[must_use]
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.inner.cache
    }

    /// Fault `page_id` in without keeping it pinned.
    ///
    /// # Returns
    /// - `Ok(false)` if the page lies beyond the end of the file
    pub fn prefetch(&self, page_id: PageId) -> Result<bool, PageCacheError> {
        if page_id >= self.page_count() {
            return Ok(false);
        }
        let index = self.pin(page_id)?;
        self.unpin(index);
        Ok(true)
    }

    /// Write all dirty pages back and sync.
    pub fn flush(&self) -> Result<(), PageCacheError> {
        self.ensure_open()?;
        self.inner
            .cache
            .flush_file(self.inner.file_id, self.inner.storage.as_ref())
    }

    /// Flush and unmap. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), PageCacheError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner
            .cache
            .unmap(self.inner.file_id, self.inner.storage.as_ref())?;
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn pin(&self, page_id: PageId) -> Result<usize, PageCacheError> {
        self.ensure_open()?;
        self.inner
            .cache
            .pin(self.inner.file_id, self.inner.storage.as_ref(), page_id)
    }

    pub(crate) fn unpin(&self, index: usize) {
        self.inner.cache.unpin(index);
    }

    pub(crate) fn frame(&self, index: usize) -> &Frame {
        self.inner.cache.frame(index)
    }

    /// Extend the logical file so it includes `page_id`.
    pub(crate) fn grow_to(&self, page_id: PageId) {
        self.inner
            .page_count
            .fetch_max(page_id.saturating_add(1), Ordering::AcqRel);
    }

    fn ensure_open(&self) -> Result<(), PageCacheError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(PageCacheError::FileClosed {
                file_id: self.inner.file_id,
            })
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for PagedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedFile")
            .field("file_id", &self.inner.file_id)
            .field("page_count", &self.page_count())
            .finish_non_exhaustive()
    }
}
