//! Token scan index.
//!
//! Maps a token (a label or relationship type) to the entities carrying it.
//! Entity ids are grouped in ranges of 64: the key is `(token, range)` and
//! the value a bitset where bit `i` stands for entity `range * 64 + i`.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::index::layout::{Layout, read_u32, read_u64, write_u32, write_u64};
use crate::index::seeker::{SeekRange, Seeker, TreeSeeker};
use crate::index::tree::{GbpTree, TreeError};
use crate::index::{IndexOrder, IndexProgressor, NO_ENTITY};
use crate::pagecache::PagedFile;

/// Entities per bitset.
pub const RANGE_SIZE: u64 = 64;

/// Range holding `entity`.
#[must_use]
pub const fn range_of(entity: u64) -> u64 {
    entity / RANGE_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokenScanKey {
    pub token: u32,
    pub range: u64,
}

impl TokenScanKey {
    #[must_use]
    pub const fn new(token: u32, range: u64) -> Self {
        Self { token, range }
    }
}

/// `(token u32, range u64) -> bitset u64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenScanLayout;

impl Layout for TokenScanLayout {
    type Key = TokenScanKey;
    type Value = u64;

    fn identifier(&self) -> u64 {
        u64::from_le_bytes(*b"TOKSCAN1")
    }

    fn key_size(&self) -> usize {
        12
    }

    fn value_size(&self) -> usize {
        8
    }

    fn write_key(&self, key: &TokenScanKey, buf: &mut [u8]) {
        write_u32(buf, 0, key.token);
        write_u64(buf, 4, key.range);
    }

    fn read_key(&self, buf: &[u8]) -> TokenScanKey {
        TokenScanKey::new(read_u32(buf, 0), read_u64(buf, 4))
    }

    fn write_value(&self, value: &u64, buf: &mut [u8]) {
        write_u64(buf, 0, *value);
    }

    fn read_value(&self, buf: &[u8]) -> u64 {
        read_u64(buf, 0)
    }

    fn compare(&self, left: &TokenScanKey, right: &TokenScanKey) -> Ordering {
        left.cmp(right)
    }
}

/// One token gained or lost by one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenChange {
    pub entity: u64,
    pub token: u32,
    pub added: bool,
}

/// A token scan index over one tree.
#[derive(Debug, Clone)]
pub struct TokenIndex {
    tree: Arc<GbpTree<TokenScanLayout>>,
}

impl TokenIndex {
    /// Open (or create) the index stored in `file`.
    pub fn open(file: PagedFile, config: &EngineConfig) -> Result<Self, TreeError> {
        Ok(Self {
            tree: GbpTree::open(file, TokenScanLayout, config)?,
        })
    }

    /// Apply changes under one writer.
    ///
    /// Bits are OR-ed in and masked out; a bitset that becomes empty removes
    /// its key.
    pub fn apply(&self, changes: impl IntoIterator<Item = TokenChange>) -> Result<(), TreeError> {
        let mut writer = self.tree.writer();
        for change in changes {
            let key = TokenScanKey::new(change.token, range_of(change.entity));
            let bit = 1u64 << (change.entity % RANGE_SIZE);
            if change.added {
                writer.update(key, |bits| Some(bits.copied().unwrap_or(0) | bit))?;
            } else {
                writer.update(key, |bits| bits.map(|b| b & !bit).filter(|b| *b != 0))?;
            }
        }
        Ok(())
    }

    /// All entities carrying `token`.
    #[must_use]
    pub fn scan(&self, token: u32, order: IndexOrder) -> TokenScanValueIndexProgressor {
        let seeker = self.tree.seek(token_range(token, 0, u64::MAX, order));
        TokenScanValueIndexProgressor::initialize(&self.tree, seeker, token, order)
    }

    pub fn checkpoint(&self) -> Result<(), TreeError> {
        self.tree.checkpoint()
    }

    pub fn close(&self) -> Result<(), TreeError> {
        self.tree.close()
    }

    #[must_use]
    pub const fn tree(&self) -> &Arc<GbpTree<TokenScanLayout>> {
        &self.tree
    }
}

fn token_range(token: u32, from: u64, to: u64, order: IndexOrder) -> SeekRange<TokenScanKey> {
    SeekRange::new(
        Bound::Included(TokenScanKey::new(token, from)),
        Bound::Included(TokenScanKey::new(token, to)),
    )
    .with_order(order)
}

/// Yields the entities of one token, one set bit at a time.
///
/// # Invariants
///
/// - `bits` only holds entities not yet returned from range `loaded`
/// - Ids come out strictly ascending (or descending)
pub struct TokenScanValueIndexProgressor {
    tree: Arc<GbpTree<TokenScanLayout>>,
    seeker: TreeSeeker<TokenScanLayout>,
    token: u32,
    order: IndexOrder,
    loaded: Option<u64>,
    bits: u64,
    current: u64,
    closed: bool,
}

impl TokenScanValueIndexProgressor {
    /// Bind to a seeker positioned at or before the first `(token, range)` key.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn initialize(
        tree: &Arc<GbpTree<TokenScanLayout>>,
        seeker: TreeSeeker<TokenScanLayout>,
        token: u32,
        order: IndexOrder,
    ) -> Self {
        Self {
            tree: Arc::clone(tree),
            seeker,
            token,
            order,
            loaded: None,
            bits: 0,
            current: NO_ENTITY,
            closed: false,
        }
    }

    const fn descending(&self) -> bool {
        matches!(self.order, IndexOrder::Descending)
    }

    /// Load the bitset of the next tree entry.
    fn next_range(&mut self) -> Result<bool, TreeError> {
        if !self.seeker.next()? {
            return Ok(false);
        }
        let (Some(key), Some(&bits)) = (self.seeker.key(), self.seeker.value()) else {
            return Ok(false);
        };
        self.loaded = Some(key.range);
        self.bits = bits;
        Ok(true)
    }

    /// Drop bits that lie before `offset` in scan order.
    const fn mask_from(&mut self, offset: u64) {
        if self.descending() {
            if offset < RANGE_SIZE - 1 {
                self.bits &= (1u64 << (offset + 1)) - 1;
            }
        } else {
            self.bits &= !((1u64 << offset) - 1);
        }
    }

    /// Position so the next `next()` returns the first id at or after `id`
    /// in scan order.
    ///
    /// Ranges between the current one and `id` are skipped with a fresh seek
    /// instead of being walked. Targets already passed are ignored.
    pub fn skip_until(&mut self, id: u64) -> Result<(), TreeError> {
        if self.closed {
            return Ok(());
        }
        let target = range_of(id);
        let offset = id % RANGE_SIZE;
        let passed = match self.loaded {
            Some(loaded) if loaded == target => {
                self.mask_from(offset);
                return Ok(());
            }
            Some(loaded) if self.descending() => loaded < target,
            Some(loaded) => loaded > target,
            None => false,
        };
        if passed {
            return Ok(());
        }

        let range = if self.descending() {
            token_range(self.token, 0, target, self.order)
        } else {
            token_range(self.token, target, u64::MAX, self.order)
        };
        self.seeker.close()?;
        self.seeker = self.tree.seek(range);
        self.bits = 0;
        if self.next_range()? && self.loaded == Some(target) {
            self.mask_from(offset);
        }
        Ok(())
    }
}

impl IndexProgressor for TokenScanValueIndexProgressor {
    fn next(&mut self) -> Result<bool, TreeError> {
        if self.closed {
            return Ok(false);
        }
        while self.bits == 0 {
            if !self.next_range()? {
                self.current = NO_ENTITY;
                return Ok(false);
            }
        }
        let bit = if self.descending() {
            u64::from(63 - self.bits.leading_zeros())
        } else {
            u64::from(self.bits.trailing_zeros())
        };
        self.bits &= !(1u64 << bit);
        let base = self.loaded.unwrap_or_default() * RANGE_SIZE;
        self.current = base + bit;
        Ok(true)
    }

    fn entity(&self) -> u64 {
        self.current
    }

    fn close(&mut self) -> Result<(), TreeError> {
        if !self.closed {
            self.closed = true;
            self.bits = 0;
            self.current = NO_ENTITY;
            self.seeker.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagecache::{PageCache, Storage};
    use crate::testing::SimulatedStorage;

    fn index() -> TokenIndex {
        let storage: Arc<dyn Storage> = Arc::new(SimulatedStorage::new(31, 512));
        let file = PageCache::with_capacity(64, 512).map_storage(storage).unwrap();
        TokenIndex::open(file, &EngineConfig::default()).unwrap()
    }

    fn add(index: &TokenIndex, token: u32, entities: &[u64]) {
        index
            .apply(entities.iter().map(|&entity| TokenChange {
                entity,
                token,
                added: true,
            }))
            .unwrap();
    }

    fn drain(progressor: &mut TokenScanValueIndexProgressor) -> Vec<u64> {
        let mut out = Vec::new();
        while progressor.next().unwrap() {
            out.push(progressor.entity());
        }
        out
    }

    #[test]
    fn test_single_range_in_both_orders() {
        let index = index();
        add(&index, 1, &[3, 7, 9, 40]);
        add(&index, 2, &[5]);

        assert_eq!(drain(&mut index.scan(1, IndexOrder::Ascending)), vec![3, 7, 9, 40]);
        assert_eq!(drain(&mut index.scan(1, IndexOrder::Descending)), vec![40, 9, 7, 3]);

        let mut skipping = index.scan(1, IndexOrder::Ascending);
        skipping.skip_until(8).unwrap();
        assert_eq!(drain(&mut skipping), vec![9, 40]);
    }

    #[test]
    fn test_descending_skip_masks_higher_bits() {
        let index = index();
        add(&index, 1, &[3, 7, 9, 40]);
        let mut progressor = index.scan(1, IndexOrder::Descending);
        assert!(progressor.next().unwrap());
        assert_eq!(progressor.entity(), 40);
        progressor.skip_until(8).unwrap();
        assert_eq!(drain(&mut progressor), vec![7, 3]);
    }

    #[test]
    fn test_skip_jumps_over_many_ranges() {
        let index = index();
        let entities: Vec<u64> = (0..5_000).map(|i| i * 37).collect();
        add(&index, 4, &entities);

        let mut progressor = index.scan(4, IndexOrder::Ascending);
        assert!(progressor.next().unwrap());
        assert_eq!(progressor.entity(), 0);
        progressor.skip_until(100_000).unwrap();
        let rest = drain(&mut progressor);
        let expected: Vec<u64> = entities.iter().copied().filter(|e| *e >= 100_000).collect();
        assert_eq!(rest, expected);

        let mut backwards = index.scan(4, IndexOrder::Descending);
        backwards.skip_until(1_000).unwrap();
        let expected: Vec<u64> =
            entities.iter().rev().copied().filter(|e| *e <= 1_000).collect();
        assert_eq!(drain(&mut backwards), expected);
    }

    #[test]
    fn test_skip_to_passed_target_is_noop() {
        let index = index();
        add(&index, 1, &[10, 200, 300]);
        let mut progressor = index.scan(1, IndexOrder::Ascending);
        assert!(progressor.next().unwrap());
        assert!(progressor.next().unwrap());
        assert_eq!(progressor.entity(), 200);
        progressor.skip_until(5).unwrap();
        assert_eq!(drain(&mut progressor), vec![300]);
    }

    #[test]
    fn test_removal_clears_bits_and_empty_ranges() {
        let index = index();
        add(&index, 9, &[1, 2, 130]);
        index
            .apply([
                TokenChange {
                    entity: 2,
                    token: 9,
                    added: false,
                },
                TokenChange {
                    entity: 130,
                    token: 9,
                    added: false,
                },
            ])
            .unwrap();
        assert_eq!(drain(&mut index.scan(9, IndexOrder::Ascending)), vec![1]);

        let mut seeker = index.tree().seek(SeekRange::all());
        let mut keys = 0;
        while seeker.next().unwrap() {
            keys += 1;
        }
        assert_eq!(keys, 1);
    }

    #[test]
    fn test_tokens_do_not_bleed_into_each_other() {
        let index = index();
        add(&index, 1, &[64, 65]);
        add(&index, 2, &[0, 64]);
        add(&index, 3, &[1_000]);
        assert_eq!(drain(&mut index.scan(2, IndexOrder::Ascending)), vec![0, 64]);
        assert_eq!(drain(&mut index.scan(2, IndexOrder::Descending)), vec![64, 0]);
        assert!(drain(&mut index.scan(7, IndexOrder::Ascending)).is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let index = index();
        add(&index, 1, &[1]);
        let mut progressor = index.scan(1, IndexOrder::Ascending);
        progressor.close().unwrap();
        progressor.close().unwrap();
        assert!(!progressor.next().unwrap());
        assert_eq!(progressor.entity(), NO_ENTITY);
    }
}
