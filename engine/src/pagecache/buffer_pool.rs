//! Buffer pool of page frames.
//!
//! The buffer pool pre-allocates every frame the page cache will ever use and
//! leases free frames out through a lock-free id queue.
//!
//! # Design
//!
//! - Pre-allocates all frames at construction time
//! - Uses a bounded MPMC queue of frame indexes as the free list
//! - Page bytes live in `AtomicU64` words, so optimistic readers and the
//!   exclusive writer share a frame without `unsafe`
//! - Each frame carries a stamp: even when stable, odd while a writer holds
//!   the frame. Readers sample it before and after reading without waiting,
//!   and retry when it was odd or changed.
//!
//! # Invariants
//!
//! - Pool capacity is fixed after construction
//! - Free list size + leased count == capacity
//! - At most one writer holds a frame (the stamp is odd exactly while it does)

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::concurrency::BoundedIdQueue;

/// Spins before a contended waiter starts yielding its time slice.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Busy-wait step used by every stamp loop.
pub(crate) fn backoff(attempt: &mut u32) {
    if *attempt < SPINS_BEFORE_YIELD {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
    *attempt = attempt.saturating_add(1);
}

/// One cached page.
pub(crate) struct Frame {
    words: Box<[AtomicU64]>,
    stamp: AtomicU64,
    pins: AtomicU32,
    dirty: AtomicBool,
    referenced: AtomicBool,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            words: (0..page_size / 8).map(|_| AtomicU64::new(0)).collect(),
            stamp: AtomicU64::new(0),
            pins: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            referenced: AtomicBool::new(false),
        }
    }

    /// Take an optimistic read stamp. Never waits: a stamp taken while a
    /// writer holds the frame is odd and fails validation.
    pub(crate) fn begin_read(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    /// Whether the bytes read since `stamp` was taken are a stable image.
    pub(crate) fn validate(&self, stamp: u64) -> bool {
        stamp & 1 == 0 && self.stamp.load(Ordering::Acquire) == stamp
    }

    /// Acquire the exclusive write lock, spinning then yielding while held.
    pub(crate) fn lock_write(&self) {
        let mut attempt = 0;
        loop {
            let stamp = self.stamp.load(Ordering::Relaxed);
            if stamp & 1 == 0
                && self
                    .stamp
                    .compare_exchange_weak(stamp, stamp + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            backoff(&mut attempt);
        }
    }

    /// Release the write lock and publish the write.
    pub(crate) fn unlock_write(&self, modified: bool) {
        if modified {
            self.dirty.store(true, Ordering::Relaxed);
        }
        self.stamp.fetch_add(1, Ordering::Release);
    }

    /// Copy bytes out of the frame, starting at `offset`.
    ///
    /// # Pre-conditions
    /// - `offset + dst.len()` is within the page
    pub(crate) fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        let mut pos = offset;
        let mut copied = 0;
        while copied < dst.len() {
            let word = self.words[pos / 8].load(Ordering::Acquire).to_le_bytes();
            let within = pos % 8;
            let take = (8 - within).min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&word[within..within + take]);
            copied += take;
            pos += take;
        }
    }

    /// Copy bytes into the frame, starting at `offset`.
    ///
    /// # Pre-conditions
    /// - The caller holds the write lock
    /// - `offset + src.len()` is within the page
    pub(crate) fn write_bytes(&self, offset: usize, src: &[u8]) {
        let mut pos = offset;
        let mut copied = 0;
        while copied < src.len() {
            let slot = &self.words[pos / 8];
            let within = pos % 8;
            let take = (8 - within).min(src.len() - copied);
            let mut word = if take == 8 {
                [0; 8]
            } else {
                slot.load(Ordering::Relaxed).to_le_bytes()
            };
            word[within..within + take].copy_from_slice(&src[copied..copied + take]);
            slot.store(u64::from_le_bytes(word), Ordering::Release);
            copied += take;
            pos += take;
        }
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
        self.referenced.store(true, Ordering::Relaxed);
    }

    pub(crate) fn unpin(&self) {
        let previous = self.pins.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "Frame unpinned more often than pinned");
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    /// Clear the reference bit, returning its previous value.
    pub(crate) fn take_reference(&self) -> bool {
        self.referenced.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Copy a consistent image of the whole page into `buf`, clearing the
    /// dirty flag first so a concurrent writer re-marks it.
    pub(crate) fn snapshot_for_flush(&self, buf: &mut [u8]) {
        self.dirty.store(false, Ordering::Relaxed);
        let mut attempt = 0;
        loop {
            let stamp = self.begin_read();
            self.read_bytes(0, buf);
            if self.validate(stamp) {
                return;
            }
            backoff(&mut attempt);
        }
    }

    /// Replace the whole page with `buf` and mark the frame clean.
    ///
    /// # Pre-conditions
    /// - The frame is unpinned and unreachable from the page table
    pub(crate) fn load(&self, buf: &[u8]) {
        self.lock_write();
        self.write_bytes(0, buf);
        self.dirty.store(false, Ordering::Relaxed);
        self.unlock_write(false);
    }
}

/// A pool of pre-allocated frames.
///
/// # Pre-conditions
/// - `capacity` must be > 0 when creating
///
/// # Post-conditions
/// - All frames are zeroed on creation
/// - Free list contains `capacity` frames
pub struct BufferPool {
    frames: Box<[Frame]>,
    free_list: BoundedIdQueue,
    page_size: usize,
}

impl BufferPool {
    /// Create a new buffer pool with the given capacity.
    ///
    /// # Panics
    /// Panics if capacity is 0 or `page_size` is not a multiple of 8.
    #[must_use]
    pub fn new(capacity: usize, page_size: usize) -> Self {
        assert!(capacity > 0, "Buffer pool capacity must be positive");
        assert!(page_size % 8 == 0, "Page size must be a multiple of 8");

        let free_list = BoundedIdQueue::new(capacity);
        for index in 0..capacity {
            free_list.offer(index as u64);
        }

        Self {
            frames: (0..capacity).map(|_| Frame::new(page_size)).collect(),
            free_list,
            page_size,
        }
    }

    /// Lease a free frame index, if any is left.
    pub fn lease(&self) -> Option<usize> {
        self.free_list
            .take()
            .and_then(|index| usize::try_from(index).ok())
    }

    /// Return a frame to the free list.
    ///
    /// # Panics
    /// Panics if returning would exceed capacity (indicates a bug).
    pub fn return_frame(&self, index: usize) {
        let accepted = self.free_list.offer(index as u64);
        assert!(accepted, "Buffer pool overflow: returning frame to full pool");
    }

    pub(crate) fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    /// Get the number of free frames.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    /// Get the total capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Size of each frame in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }
}
