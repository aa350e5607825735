//! Adaptive pre-fetching for sequential read cursors.
//!
//! A pre-fetcher is a background thread attached to one read cursor. It only
//! ever looks at the cursor's observed page id, through `Relaxed` loads. A
//! stale value makes it fetch too little or too much, never changes what the
//! cursor reads.
//!
//! Lifecycle:
//!
//! 1. Wait for the cursor to bind a first page, up to `start_timeout`.
//! 2. Wait for it to move to a second page, up to `direction_timeout`; the
//!    move decides between forward and backward.
//! 3. Keep faulting pages in ahead of the cursor. The distance doubles each
//!    time the cursor catches up with the prefetched front and halves while
//!    the cursor stalls. Idle waits spin first, then park for `pause`.
//!
//! Closing the cursor fires a cancellation listener that flags the thread and
//! unparks it, so it exits within one pause interval even mid-wait.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, Thread};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::EngineConfig;
use crate::pagecache::cache::PagedFile;
use crate::pagecache::cursor::{CancellationListener, ReadPageCursor, UNBOUND_PAGE_ID};

/// Parks without cursor movement before the distance is halved.
const STALL_PARKS: u32 = 8;

/// Direction inferred from the first two observed pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

/// Why a pre-fetcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreFetchOutcome {
    /// The cursor never bound a page within the start timeout.
    NeverStarted,
    /// The cursor never moved within the direction timeout.
    NeverMoved,
    /// The cursor closed.
    CursorClosed,
    /// Faulting a page failed; the cursor will see the error itself.
    Failed,
}

/// Summary returned by `PreFetchHandle::join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreFetchReport {
    pub outcome: PreFetchOutcome,
    pub direction: Option<ScanDirection>,
    pub pages_prefetched: u64,
}

/// Tuning knobs, usually taken from `EngineConfig`.
#[derive(Debug, Clone, Copy)]
pub struct PreFetchSettings {
    pub start_timeout: Duration,
    pub direction_timeout: Duration,
    pub spin_iterations: u32,
    pub pause: Duration,
    pub max_distance: u64,
}

impl From<&EngineConfig> for PreFetchSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            start_timeout: config.prefetch_start_timeout,
            direction_timeout: config.prefetch_direction_timeout,
            spin_iterations: config.prefetch_spin_iterations,
            pause: config.prefetch_pause,
            max_distance: config.prefetch_max_distance.max(1),
        }
    }
}

struct CancelSignal {
    cancelled: AtomicBool,
    thread: OnceLock<Thread>,
}

impl CancelSignal {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl CancellationListener for CancelSignal {
    fn on_cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

/// Handle to a running pre-fetcher.
pub struct PreFetchHandle {
    signal: Arc<CancelSignal>,
    thread: JoinHandle<PreFetchReport>,
}

impl PreFetchHandle {
    /// Stop the pre-fetcher without closing the cursor.
    pub fn cancel(&self) {
        self.signal.on_cancel();
    }

    /// Wait for the thread to finish.
    ///
    /// # Panics
    /// Re-raises a panic of the pre-fetch thread.
    pub fn join(self) -> PreFetchReport {
        match self.thread.join() {
            Ok(report) => report,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Start a pre-fetcher following `cursor`.
#[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
pub fn attach(
    cursor: &mut ReadPageCursor,
    settings: PreFetchSettings,
) -> std::io::Result<PreFetchHandle> {
    let signal = Arc::new(CancelSignal {
        cancelled: AtomicBool::new(false),
        thread: OnceLock::new(),
    });
    let worker = PreFetcher {
        file: cursor.file().clone(),
        observed: cursor.observed_page_id(),
        signal: Arc::clone(&signal),
        settings,
    };
    let thread = std::thread::Builder::new()
        .name("page-prefetcher".to_string())
        .spawn(move || worker.run())?;
    let _ = signal.thread.set(thread.thread().clone());
    cursor.register_cancellation_listener(Arc::clone(&signal) as Arc<dyn CancellationListener>);
    Ok(PreFetchHandle { signal, thread })
}

struct PreFetcher {
    file: PagedFile,
    observed: Arc<AtomicU64>,
    signal: Arc<CancelSignal>,
    settings: PreFetchSettings,
}

impl PreFetcher {
    fn run(self) -> PreFetchReport {
        let mut report = PreFetchReport {
            outcome: PreFetchOutcome::CursorClosed,
            direction: None,
            pages_prefetched: 0,
        };

        let Some(start) = self.wait_for(self.settings.start_timeout, |page| page) else {
            report.outcome = self.gave_up(PreFetchOutcome::NeverStarted);
            return report;
        };
        let Some(second) =
            self.wait_for(self.settings.direction_timeout, |page| page.filter(|p| *p != start))
        else {
            report.outcome = self.gave_up(PreFetchOutcome::NeverMoved);
            return report;
        };

        let direction = if second > start {
            ScanDirection::Forward
        } else {
            ScanDirection::Backward
        };
        report.direction = Some(direction);
        debug!(start, ?direction, "prefetcher following cursor");

        let mut distance = 1u64;
        let mut front = second;
        let mut last_seen = second;
        let mut idle = 0u32;

        while !self.signal.is_cancelled() {
            let current = self.observed.load(Ordering::Relaxed);
            if current != UNBOUND_PAGE_ID {
                let caught_up = match direction {
                    ScanDirection::Forward => current >= front,
                    ScanDirection::Backward => current <= front,
                };
                if caught_up {
                    distance = (distance * 2).min(self.settings.max_distance);
                    front = current;
                }
                if current == last_seen {
                    idle = idle.saturating_add(1);
                } else {
                    last_seen = current;
                    idle = 0;
                }
                if idle >= self.settings.spin_iterations.saturating_add(STALL_PARKS) {
                    distance = (distance / 2).max(1);
                    idle = self.settings.spin_iterations;
                }

                let target = match direction {
                    ScanDirection::Forward => current.saturating_add(distance),
                    ScanDirection::Backward => current.saturating_sub(distance),
                };
                loop {
                    let next = match direction {
                        ScanDirection::Forward if front < target => front + 1,
                        ScanDirection::Backward if front > target => front - 1,
                        _ => break,
                    };
                    match self.file.prefetch(next) {
                        Ok(true) => {
                            report.pages_prefetched += 1;
                            front = next;
                        }
                        Ok(false) => break,
                        Err(e) => {
                            debug!(page = next, error = %e, "prefetch failed, stopping");
                            report.outcome = PreFetchOutcome::Failed;
                            return report;
                        }
                    }
                }
            } else {
                idle = idle.saturating_add(1);
            }
            self.pause(idle);
        }
        report
    }

    /// Poll the observed page id until `accept` yields a value or time runs out.
    fn wait_for(
        &self,
        timeout: Duration,
        accept: impl Fn(Option<u64>) -> Option<u64>,
    ) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        let mut idle = 0u32;
        loop {
            if self.signal.is_cancelled() {
                return None;
            }
            let page = self.observed.load(Ordering::Relaxed);
            if let Some(found) = accept((page != UNBOUND_PAGE_ID).then_some(page)) {
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            idle = idle.saturating_add(1);
            self.pause(idle);
        }
    }

    fn gave_up(&self, reason: PreFetchOutcome) -> PreFetchOutcome {
        if self.signal.is_cancelled() {
            PreFetchOutcome::CursorClosed
        } else {
            debug!(?reason, "prefetcher giving up");
            reason
        }
    }

    fn pause(&self, idle: u32) {
        if idle < self.settings.spin_iterations {
            std::hint::spin_loop();
        } else {
            std::thread::park_timeout(self.settings.pause);
        }
    }
}
