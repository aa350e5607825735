//! Page cursors: the only way to look at cached pages.
//!
//! A cursor is bound to at most one page at a time and keeps it pinned while
//! bound. Two variants share the `PageCursor` contract:
//!
//! - `ReadPageCursor` never blocks writers and never waits for them. It
//!   records the frame stamp when it binds; callers read what they need and then ask `should_retry()`. A `true`
//!   answer means a writer interleaved, every value read since binding must be
//!   discarded and the read repeated.
//! - `WritePageCursor` holds the frame's exclusive lock while bound. Its writes
//!   become visible to readers when it moves on or closes.
//!
//! Offsets past the page never panic: they raise a bounds flag that callers
//! inspect with `check_and_clear_bounds()`.
//!
//! # Pre-conditions
//!
//! A thread must not read a page it currently holds through a write cursor;
//! `should_retry()` keeps answering `true` until that lock is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pagecache::cache::{PageCacheError, PagedFile};
use crate::pagecache::PageId;

/// Value of an observed page id while the cursor is not bound.
pub const UNBOUND_PAGE_ID: u64 = u64::MAX;

/// Callback fired once when a cursor closes.
pub trait CancellationListener: Send + Sync {
    fn on_cancel(&self);
}

/// Shared contract of read and write cursors.
pub trait PageCursor {
    /// Bind the page after the current one (or the start page on first call).
    ///
    /// # Returns
    /// - `Ok(false)` when a read cursor reaches the end of the file
    fn next(&mut self) -> Result<bool, PageCacheError>;

    /// Bind `page_id`; later `next()` calls continue from `page_id + 1`.
    fn next_to(&mut self, page_id: PageId) -> Result<bool, PageCacheError>;

    /// Page the cursor is bound to.
    fn current_page_id(&self) -> Option<PageId>;

    /// Copy bytes from the bound page. Out-of-page reads yield zeros and set
    /// the bounds flag.
    fn get_bytes(&mut self, offset: usize, dst: &mut [u8]);

    /// Whether the values read since binding must be discarded.
    fn should_retry(&mut self) -> bool;

    /// Return and reset the bounds flag.
    fn check_and_clear_bounds(&mut self) -> bool;

    /// Unpin the page and fire cancellation listeners. Idempotent.
    fn close(&mut self);

    fn get_u8(&mut self, offset: usize) -> u8 {
        let mut buf = [0u8; 1];
        self.get_bytes(offset, &mut buf);
        buf[0]
    }

    fn get_u32(&mut self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.get_bytes(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn get_u64(&mut self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        self.get_bytes(offset, &mut buf);
        u64::from_le_bytes(buf)
    }
}

/// State common to both cursor variants.
struct CursorCore {
    file: PagedFile,
    next_page_id: PageId,
    bound: Option<(PageId, usize)>,
    out_of_bounds: bool,
    closed: bool,
    observed: Arc<AtomicU64>,
    listeners: Vec<Arc<dyn CancellationListener>>,
}

impl CursorCore {
    fn new(file: PagedFile, start_page: PageId) -> Self {
        Self {
            file,
            next_page_id: start_page,
            bound: None,
            out_of_bounds: false,
            closed: false,
            observed: Arc::new(AtomicU64::new(UNBOUND_PAGE_ID)),
            listeners: Vec::new(),
        }
    }

    fn bind(&mut self, page_id: PageId) -> Result<usize, PageCacheError> {
        let index = self.file.pin(page_id)?;
        self.bound = Some((page_id, index));
        self.next_page_id = page_id.saturating_add(1);
        self.out_of_bounds = false;
        self.observed.store(page_id, Ordering::Relaxed);
        Ok(index)
    }

    fn unbind(&mut self) -> Option<usize> {
        let (_, index) = self.bound.take()?;
        self.file.unpin(index);
        Some(index)
    }

    fn range_ok(&mut self, offset: usize, len: usize) -> bool {
        let fits = self.bound.is_some()
            && offset
                .checked_add(len)
                .is_some_and(|end| end <= self.file.page_size());
        if !fits {
            self.out_of_bounds = true;
        }
        fits
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.observed.store(UNBOUND_PAGE_ID, Ordering::Relaxed);
        for listener in self.listeners.drain(..) {
            listener.on_cancel();
        }
    }
}

/// Optimistic, lock-free read cursor.
pub struct ReadPageCursor {
    core: CursorCore,
    stamp: u64,
}

impl ReadPageCursor {
    pub(crate) fn new(file: PagedFile, start_page: PageId) -> Self {
        Self {
            core: CursorCore::new(file, start_page),
            stamp: 0,
        }
    }

    /// Handle through which another thread can watch this cursor move.
    ///
    /// Loads are `Relaxed`: a stale value only makes a watcher lag behind.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn observed_page_id(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.core.observed)
    }

    /// The file this cursor reads.
    #[must_use]
    pub const fn file(&self) -> &PagedFile {
        &self.core.file
    }

    /// Register a listener fired when this cursor closes.
    pub fn register_cancellation_listener(&mut self, listener: Arc<dyn CancellationListener>) {
        if self.core.closed {
            listener.on_cancel();
        } else {
            self.core.listeners.push(listener);
        }
    }
}

impl PageCursor for ReadPageCursor {
    fn next(&mut self) -> Result<bool, PageCacheError> {
        self.next_to(self.core.next_page_id)
    }

    fn next_to(&mut self, page_id: PageId) -> Result<bool, PageCacheError> {
        self.core.unbind();
        if self.core.closed || page_id >= self.core.file.page_count() {
            self.core.observed.store(UNBOUND_PAGE_ID, Ordering::Relaxed);
            return Ok(false);
        }
        let index = self.core.bind(page_id)?;
        self.stamp = self.core.file.frame(index).begin_read();
        Ok(true)
    }

    fn current_page_id(&self) -> Option<PageId> {
        self.core.bound.map(|(page_id, _)| page_id)
    }

    fn get_bytes(&mut self, offset: usize, dst: &mut [u8]) {
        if !self.core.range_ok(offset, dst.len()) {
            dst.fill(0);
            return;
        }
        if let Some((_, index)) = self.core.bound {
            self.core.file.frame(index).read_bytes(offset, dst);
        }
    }

    fn should_retry(&mut self) -> bool {
        let Some((_, index)) = self.core.bound else {
            return false;
        };
        let frame = self.core.file.frame(index);
        if frame.validate(self.stamp) {
            return false;
        }
        self.stamp = frame.begin_read();
        self.core.out_of_bounds = false;
        true
    }

    fn check_and_clear_bounds(&mut self) -> bool {
        std::mem::take(&mut self.core.out_of_bounds)
    }

    fn close(&mut self) {
        self.core.unbind();
        self.core.close();
    }
}

impl Drop for ReadPageCursor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Exclusive write cursor.
pub struct WritePageCursor {
    core: CursorCore,
    modified: bool,
}

impl WritePageCursor {
    pub(crate) fn new(file: PagedFile, start_page: PageId) -> Self {
        Self {
            core: CursorCore::new(file, start_page),
            modified: false,
        }
    }

    /// Copy bytes into the bound page. Out-of-page writes are dropped and set
    /// the bounds flag.
    pub fn put_bytes(&mut self, offset: usize, src: &[u8]) {
        if !self.core.range_ok(offset, src.len()) {
            return;
        }
        if let Some((_, index)) = self.core.bound {
            self.core.file.frame(index).write_bytes(offset, src);
            self.modified = true;
        }
    }

    pub fn put_u8(&mut self, offset: usize, value: u8) {
        self.put_bytes(offset, &[value]);
    }

    pub fn put_u32(&mut self, offset: usize, value: u32) {
        self.put_bytes(offset, &value.to_le_bytes());
    }

    pub fn put_u64(&mut self, offset: usize, value: u64) {
        self.put_bytes(offset, &value.to_le_bytes());
    }

    fn release(&mut self) {
        if let Some((_, index)) = self.core.bound {
            self.core
                .file
                .frame(index)
                .unlock_write(std::mem::take(&mut self.modified));
        }
        self.core.unbind();
    }
}

impl PageCursor for WritePageCursor {
    fn next(&mut self) -> Result<bool, PageCacheError> {
        self.next_to(self.core.next_page_id)
    }

    /// Write cursors extend the file instead of stopping at its end.
    fn next_to(&mut self, page_id: PageId) -> Result<bool, PageCacheError> {
        self.release();
        if self.core.closed {
            return Ok(false);
        }
        let index = self.core.bind(page_id)?;
        self.core.file.grow_to(page_id);
        self.core.file.frame(index).lock_write();
        Ok(true)
    }

    fn current_page_id(&self) -> Option<PageId> {
        self.core.bound.map(|(page_id, _)| page_id)
    }

    fn get_bytes(&mut self, offset: usize, dst: &mut [u8]) {
        if !self.core.range_ok(offset, dst.len()) {
            dst.fill(0);
            return;
        }
        if let Some((_, index)) = self.core.bound {
            self.core.file.frame(index).read_bytes(offset, dst);
        }
    }

    fn should_retry(&mut self) -> bool {
        false
    }

    fn check_and_clear_bounds(&mut self) -> bool {
        std::mem::take(&mut self.core.out_of_bounds)
    }

    fn close(&mut self) {
        self.release();
        self.core.close();
    }
}

impl Drop for WritePageCursor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::pagecache::PageCache;
    use crate::testing::SimulatedStorage;

    fn new_file(pages: usize) -> PagedFile {
        let cache = PageCache::with_capacity(pages, 256);
        cache
            .map_storage(Arc::new(SimulatedStorage::new(0, 256)))
            .unwrap()
    }

    #[test]
    fn test_read_cursor_stops_at_end_of_file() {
        let file = new_file(4);
        let mut writer = file.write_cursor(0);
        assert!(writer.next().unwrap());
        assert!(writer.next().unwrap());
        writer.close();

        let mut reader = file.read_cursor(0);
        assert!(reader.next().unwrap());
        assert_eq!(reader.current_page_id(), Some(0));
        assert!(reader.next().unwrap());
        assert_eq!(reader.current_page_id(), Some(1));
        assert!(!reader.next().unwrap());
        assert!(!reader.next().unwrap());
        assert_eq!(reader.current_page_id(), None);
    }

    #[test]
    fn test_out_of_bounds_access_sets_flag() {
        let file = new_file(2);
        let mut writer = file.write_cursor(0);
        assert!(writer.next().unwrap());
        writer.put_u64(252, 1);
        assert!(writer.check_and_clear_bounds());
        assert!(!writer.check_and_clear_bounds());
        writer.put_u32(252, 9);
        assert!(!writer.check_and_clear_bounds());
        writer.close();

        let mut reader = file.read_cursor(0);
        assert!(reader.next().unwrap());
        assert_eq!(reader.get_u64(usize::MAX - 2), 0);
        assert!(reader.check_and_clear_bounds());
        assert_eq!(reader.get_u32(252), 9);
        assert!(!reader.check_and_clear_bounds());
    }

    #[test]
    fn test_should_retry_after_interleaved_write() {
        let file = new_file(2);
        let mut writer = file.write_cursor(0);
        assert!(writer.next().unwrap());
        writer.put_u64(0, 1);
        writer.close();

        let mut reader = file.read_cursor(0);
        assert!(reader.next().unwrap());
        assert_eq!(reader.get_u64(0), 1);

        let mut writer = file.write_cursor(0);
        assert!(writer.next().unwrap());
        writer.put_u64(0, 2);
        writer.close();

        assert!(reader.should_retry());
        assert_eq!(reader.get_u64(0), 2);
        assert!(!reader.should_retry());
    }

    #[test]
    fn test_reader_does_not_wait_for_held_writer() {
        let file = new_file(2);
        let mut writer = file.write_cursor(0);
        assert!(writer.next().unwrap());
        writer.put_u64(0, 1);

        // Binding and reading must return while the writer still holds the page.
        let mut reader = file.read_cursor(0);
        assert!(reader.next().unwrap());
        let _ = reader.get_u64(0);
        assert!(reader.should_retry());
        assert!(reader.should_retry());

        writer.put_u64(0, 2);
        writer.close();

        assert!(reader.should_retry());
        assert_eq!(reader.get_u64(0), 2);
        assert!(!reader.should_retry());
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_pages() {
        let file = new_file(4);
        let mut writer = file.write_cursor(0);
        assert!(writer.next().unwrap());
        writer.close();

        std::thread::scope(|scope| {
            let writer_file = file.clone();
            scope.spawn(move || {
                for round in 1..=2_000u64 {
                    let mut writer = writer_file.write_cursor(0);
                    assert!(writer.next().unwrap());
                    for slot in 0..32 {
                        writer.put_u64(slot * 8, round);
                    }
                    writer.close();
                }
            });
            for _ in 0..2 {
                let reader_file = file.clone();
                scope.spawn(move || {
                    let mut reader = reader_file.read_cursor(0);
                    assert!(reader.next().unwrap());
                    for _ in 0..2_000 {
                        let values = loop {
                            let values: Vec<u64> =
                                (0..32).map(|slot| reader.get_u64(slot * 8)).collect();
                            if !reader.should_retry() {
                                break values;
                            }
                        };
                        assert!(values.iter().all(|v| *v == values[0]));
                    }
                });
            }
        });
    }

    struct CountingListener(AtomicUsize);

    impl CancellationListener for CountingListener {
        fn on_cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_close_is_idempotent_and_fires_listeners_once() {
        let file = new_file(2);
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        let mut reader = file.read_cursor(0);
        reader.register_cancellation_listener(Arc::clone(&listener) as Arc<dyn CancellationListener>);
        let observed = reader.observed_page_id();

        reader.close();
        reader.close();
        drop(reader);

        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        assert_eq!(observed.load(Ordering::Relaxed), UNBOUND_PAGE_ID);
    }

    #[test]
    fn test_write_cursor_blocks_second_writer_until_released() {
        let file = new_file(4);
        let mut first = file.write_cursor(0);
        assert!(first.next().unwrap());
        first.put_u64(0, 1);

        std::thread::scope(|scope| {
            let second_file = file.clone();
            let handle = scope.spawn(move || {
                let mut second = second_file.write_cursor(0);
                assert!(second.next().unwrap());
                let seen = second.get_u64(0);
                second.put_u64(0, seen + 1);
                second.close();
                seen
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            first.put_u64(0, 41);
            first.close();
            assert_eq!(handle.join().unwrap(), 41);
        });

        let mut reader = file.read_cursor(0);
        assert!(reader.next().unwrap());
        assert_eq!(reader.get_u64(0), 42);
    }
}
