//! Transaction metadata lookup: where in the log a transaction starts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::txlog::{CommandBatchCursor, ForwardLogCursor, LogError, LogFiles, LogPosition, Terminator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionMetadata {
    pub tx_id: u64,
    /// Position of the transaction's first `Start` entry.
    pub start_position: LogPosition,
    pub time_millis: u64,
}

#[derive(Debug)]
struct Slot {
    metadata: TransactionMetadata,
    frequency: u64,
    tick: u64,
}

#[derive(Debug, Default)]
struct LfuState {
    slots: HashMap<u64, Slot>,
    /// `(frequency, tick, tx_id)`; the first element is the eviction victim.
    order: BTreeSet<(u64, u64, u64)>,
    tick: u64,
}

impl LfuState {
    fn touch(&mut self, tx_id: u64) -> Option<TransactionMetadata> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.slots.get_mut(&tx_id)?;
        self.order.remove(&(slot.frequency, slot.tick, tx_id));
        slot.frequency += 1;
        slot.tick = tick;
        self.order.insert((slot.frequency, slot.tick, tx_id));
        Some(slot.metadata)
    }
}

/// Bounded least-frequently-used cache of transaction metadata.
///
/// Ties in frequency evict the entry used longest ago.
#[derive(Debug)]
pub struct TransactionMetadataCache {
    capacity: usize,
    state: Mutex<LfuState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TransactionMetadataCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LfuState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, tx_id: u64) -> Option<TransactionMetadata> {
        let found = self.state.lock().touch(tx_id);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn put(&self, metadata: TransactionMetadata) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(&metadata.tx_id) {
            slot.metadata = metadata;
            state.touch(metadata.tx_id);
            return;
        }
        if state.slots.len() >= self.capacity {
            if let Some((_, _, victim)) = state.order.pop_first() {
                state.slots.remove(&victim);
            }
        }
        state.tick += 1;
        let tick = state.tick;
        state.slots.insert(
            metadata.tx_id,
            Slot {
                metadata,
                frequency: 1,
                tick,
            },
        );
        state.order.insert((1, tick, metadata.tx_id));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        state.order.clear();
    }

    /// `(hits, misses)` since creation.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

/// Finds transaction start positions, consulting the cache before scanning
/// the log.
#[derive(Debug)]
pub struct TransactionLocator {
    files: LogFiles,
    cache: Arc<TransactionMetadataCache>,
    read_ahead: usize,
}

impl TransactionLocator {
    #[must_use]
    pub fn new(files: &LogFiles, cache: Arc<TransactionMetadataCache>, read_ahead: usize) -> Self {
        Self {
            files: files.clone(),
            cache,
            read_ahead,
        }
    }

    /// Metadata of committed transaction `tx_id`, `None` if the log does not
    /// hold it.
    ///
    /// A cache miss scans forward from the newest version whose header says
    /// `tx_id` was not committed before it. A chunked transaction can start
    /// versions before it commits, so when the scan meets later chunks only,
    /// it retries from the version before.
    pub fn find(&self, tx_id: u64) -> Result<Option<TransactionMetadata>, LogError> {
        if let Some(metadata) = self.cache.get(tx_id) {
            return Ok(Some(metadata));
        }
        let versions = self.files.versions()?;
        let mut candidate = None;
        for (index, &version) in versions.iter().enumerate().rev() {
            if self.files.header(version)?.previous_last_tx_id < tx_id {
                candidate = Some(index);
                break;
            }
        }
        let Some(mut index) = candidate else {
            return Ok(None);
        };

        loop {
            let version = versions[index];
            debug!(tx_id, version, "scanning log for transaction start");
            match self.scan(tx_id, version)? {
                Scan::Found(metadata) => {
                    self.cache.put(metadata);
                    return Ok(Some(metadata));
                }
                Scan::Absent => return Ok(None),
                Scan::StartedEarlier if index == 0 => {
                    debug!(tx_id, version, "first chunk of transaction is no longer in the log");
                    return Ok(None);
                }
                Scan::StartedEarlier => index -= 1,
            }
        }
    }

    fn scan(&self, tx_id: u64, version: u64) -> Result<Scan, LogError> {
        let mut cursor = ForwardLogCursor::open(&self.files, LogPosition::start_of(version), self.read_ahead)?;
        let mut start = None;
        let mut outcome = Scan::Absent;
        while cursor.next()? {
            let Some(logged) = cursor.get() else { break };
            if logged.batch.tx_id != tx_id {
                continue;
            }
            if logged.batch.chunk_id == 0 {
                start = Some(logged.start);
            }
            match logged.batch.terminator {
                Terminator::Commit => {
                    outcome = match start {
                        Some(start_position) => Scan::Found(TransactionMetadata {
                            tx_id,
                            start_position,
                            time_millis: logged.batch.time_millis,
                        }),
                        None => Scan::StartedEarlier,
                    };
                    break;
                }
                Terminator::Rollback => break,
                Terminator::ChunkEnd => {}
            }
        }
        cursor.close()?;
        Ok(outcome)
    }
}

/// What one forward scan learned about a transaction.
enum Scan {
    Found(TransactionMetadata),
    /// Not committed in the scanned range.
    Absent,
    /// Committed, but its first chunk lies in an earlier version.
    StartedEarlier,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::kernel::StorageCommand;
    use crate::txlog::{CommandBatch, LogAppender};

    fn metadata(tx_id: u64) -> TransactionMetadata {
        TransactionMetadata {
            tx_id,
            start_position: LogPosition::new(0, tx_id * 100),
            time_millis: tx_id,
        }
    }

    #[test]
    fn test_least_frequently_used_is_evicted() {
        let cache = TransactionMetadataCache::new(3);
        for tx_id in 1..=3 {
            cache.put(metadata(tx_id));
        }
        assert!(cache.get(1).is_some());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());

        cache.put(metadata(4));
        assert_eq!(cache.len(), 3);
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
        assert!(cache.get(4).is_some());
    }

    #[test]
    fn test_ties_evict_oldest() {
        let cache = TransactionMetadataCache::new(2);
        cache.put(metadata(1));
        cache.put(metadata(2));
        cache.put(metadata(3));
        assert!(cache.get(1).is_none());
        assert_eq!(cache.get(3), Some(metadata(3)));
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_zero_capacity_caches_nothing() {
        let cache = TransactionMetadataCache::new(0);
        cache.put(metadata(1));
        assert!(cache.is_empty());
        cache.clear();
    }

    #[test]
    fn test_locator_scans_the_right_version() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        let config = EngineConfig {
            log_rotation_threshold: 200,
            ..EngineConfig::default()
        };
        let mut appender = LogAppender::open(&files, &config).unwrap();
        let mut starts = HashMap::new();
        for tx_id in 1..=12 {
            let batch = CommandBatch::committed(
                tx_id,
                tx_id * 10,
                vec![StorageCommand::TokenRemoved {
                    entity: tx_id,
                    token: 9,
                }],
            );
            starts.insert(tx_id, appender.append(&batch).unwrap().start_position);
        }

        let cache = Arc::new(TransactionMetadataCache::new(8));
        #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
        let locator = TransactionLocator::new(&files, Arc::clone(&cache), 128);
        let found = locator.find(7).unwrap().unwrap();
        assert_eq!(found.start_position, starts[&7]);
        assert_eq!(found.time_millis, 70);
        assert!(locator.find(99).unwrap().is_none());

        assert_eq!(cache.len(), 1);
        assert_eq!(locator.find(7).unwrap(), Some(found));
    }

    #[test]
    fn test_locator_finds_first_chunk_across_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::open(dir.path()).unwrap();
        // Every append lands in a fresh version.
        let config = EngineConfig {
            log_rotation_threshold: 1,
            ..EngineConfig::default()
        };
        let cache = Arc::new(TransactionMetadataCache::new(8));
        #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
        let mut appender = LogAppender::open(&files, &config)
            .unwrap()
            .with_metadata_cache(Arc::clone(&cache));
        let command = |entity| StorageCommand::TokenAdded { entity, token: 1 };

        appender.append(&CommandBatch::committed(1, 10, vec![command(1)])).unwrap();
        let first_chunk = CommandBatch {
            terminator: Terminator::ChunkEnd,
            ..CommandBatch::committed(2, 20, vec![command(2)])
        };
        let first_start = appender.append(&first_chunk).unwrap().start_position;
        appender
            .append(&CommandBatch {
                chunk_id: 1,
                ..CommandBatch::committed(2, 21, vec![command(3)])
            })
            .unwrap();
        assert!(files.versions().unwrap().len() >= 3);

        let cached = cache.get(2).unwrap();
        assert_eq!(cached.start_position, first_start);

        cache.clear();
        #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
        let locator = TransactionLocator::new(&files, Arc::clone(&cache), 64);
        assert_eq!(locator.find(2).unwrap(), Some(cached));
        assert_eq!(locator.find(1).unwrap().unwrap().start_position.log_version, 1);
    }
}
