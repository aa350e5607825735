//! Simulated in-memory storage for deterministic testing.
//!
//! This module provides an in-memory implementation of the page cache's
//! `Storage` trait with support for fault injection:
//! - Page-level read/write errors, random or pinned to chosen pages
//! - Byte-level corruption (bit flips)
//! - Partial writes
//! - Sync failures

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::pagecache::{PageId, Storage, StorageError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability of page corruption on read (0.0 - 1.0).
    pub corruption_rate: f64,
    /// Probability of partial write (0.0 - 1.0).
    pub partial_write_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with high fault rates (for extreme testing).
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.05,
            write_error_rate: 0.05,
            sync_error_rate: 0.05,
            corruption_rate: 0.05,
            partial_write_rate: 0.05,
        }
    }
}

/// Statistics about simulated storage operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulatedStorageStats {
    /// Number of page reads.
    pub reads: u64,
    /// Number of page writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of corrupted pages returned.
    pub corrupted_reads: u64,
    /// Number of partial writes.
    pub partial_writes: u64,
}

struct SimulatedState {
    pages: HashMap<PageId, Vec<u8>>,
    page_count: u64,
    failing_pages: HashSet<PageId>,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: SimulatedStorageStats,
}

impl SimulatedState {
    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }
}

/// In-memory storage implementation for deterministic testing.
///
/// The same seed produces the same sequence of faults for the same sequence
/// of calls. State sits behind a mutex so the page cache may call in from
/// several threads.
pub struct SimulatedStorage {
    page_size: usize,
    state: Mutex<SimulatedState>,
}

impl SimulatedStorage {
    /// Create a new simulated storage with the given seed and no faults.
    #[must_use]
    pub fn new(seed: u64, page_size: usize) -> Self {
        Self::with_config(seed, page_size, FaultConfig::default())
    }

    /// Create a new simulated storage with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, page_size: usize, fault_config: FaultConfig) -> Self {
        Self {
            page_size,
            state: Mutex::new(SimulatedState {
                pages: HashMap::new(),
                page_count: 0,
                failing_pages: HashSet::new(),
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: SimulatedStorageStats::default(),
            }),
        }
    }

    /// Get the current statistics.
    #[must_use]
    pub fn stats(&self) -> SimulatedStorageStats {
        self.state.lock().stats.clone()
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.state.lock().fault_config = config;
    }

    /// Make every read of `page_id` fail until cleared.
    pub fn fail_reads_of(&self, page_id: PageId) {
        self.state.lock().failing_pages.insert(page_id);
    }

    /// Stop failing pinned pages.
    pub fn clear_failing_pages(&self) {
        self.state.lock().failing_pages.clear();
    }

    /// Flip one bit of a stored page, as a torn sector would.
    pub fn flip_bit(&self, page_id: PageId, byte_offset: usize, bit: u8) {
        let mut state = self.state.lock();
        if let Some(page) = state.pages.get_mut(&page_id) {
            page[byte_offset] ^= 1 << bit;
        }
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
}

impl Storage for SimulatedStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_len(buf.len())?;
        let mut state = self.state.lock();
        state.stats.reads += 1;

        let rate = state.fault_config.read_error_rate;
        if state.failing_pages.contains(&page_id) || state.should_inject_fault(rate) {
            state.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(format!(
                "simulated read error on page {page_id}"
            )));
        }

        match state.pages.get(&page_id) {
            Some(page) => buf.copy_from_slice(page),
            None => buf.fill(0),
        }

        let rate = state.fault_config.corruption_rate;
        if state.should_inject_fault(rate) {
            state.stats.corrupted_reads += 1;
            // Flip 1-8 random bits
            let flips = state.rng.random_range(1..=8);
            for _ in 0..flips {
                let byte_offset = state.rng.random_range(0..buf.len());
                let bit = state.rng.random_range(0..8u8);
                buf[byte_offset] ^= 1 << bit;
            }
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<(), StorageError> {
        self.check_len(buf.len())?;
        let mut state = self.state.lock();
        state.stats.writes += 1;

        let rate = state.fault_config.write_error_rate;
        if state.should_inject_fault(rate) {
            state.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        let mut page = buf.to_vec();
        let rate = state.fault_config.partial_write_rate;
        if state.should_inject_fault(rate) {
            state.stats.partial_writes += 1;
            let cutoff = state.rng.random_range(0..page.len());
            page[cutoff..].fill(0);
        }

        state.pages.insert(page_id, page);
        state.page_count = state.page_count.max(page_id + 1);
        Ok(())
    }

    fn page_count(&self) -> Result<u64, StorageError> {
        Ok(self.state.lock().page_count)
    }

    fn sync(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.stats.syncs += 1;
        let rate = state.fault_config.sync_error_rate;
        if state.should_inject_fault(rate) {
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_storage_basic() {
        let storage = SimulatedStorage::new(42, 64);
        storage.write_page(2, &[9; 64]).unwrap();
        assert_eq!(storage.page_count().unwrap(), 3);

        let mut buf = [0u8; 64];
        storage.read_page(2, &mut buf).unwrap();
        assert_eq!(buf, [9; 64]);
        storage.read_page(1, &mut buf).unwrap();
        assert_eq!(buf, [0; 64]);
        assert_eq!(storage.stats().reads, 2);
    }

    #[test]
    fn test_simulated_storage_fault_injection() {
        let storage = SimulatedStorage::with_config(
            1,
            64,
            FaultConfig {
                read_error_rate: 1.0,
                ..FaultConfig::default()
            },
        );
        let mut buf = [0u8; 64];
        assert!(matches!(
            storage.read_page(0, &mut buf),
            Err(StorageError::InjectedFault(_))
        ));
        assert_eq!(storage.stats().injected_read_errors, 1);
    }

    #[test]
    fn test_simulated_storage_deterministic() {
        let run = |seed| {
            let storage = SimulatedStorage::with_config(seed, 64, FaultConfig::high_faults());
            let mut outcomes = Vec::new();
            for page_id in 0..200 {
                outcomes.push(storage.write_page(page_id, &[1; 64]).is_ok());
            }
            outcomes
        };
        assert_eq!(run(12345), run(12345));
    }
}
