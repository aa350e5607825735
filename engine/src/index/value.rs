//! Value index: entities ordered by one integer property.
//!
//! Keys are `(value, entity)` so equal values stay distinct entries and come
//! back ordered by entity; there is no payload.

use std::cmp::Ordering;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::index::layout::{Layout, read_u64, write_u64};
use crate::index::seeker::{SeekRange, Seeker, TreeSeeker};
use crate::index::tree::{GbpTree, TreeError};
use crate::index::{IndexOrder, IndexProgressor, NO_ENTITY};
use crate::pagecache::PagedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValueKey {
    pub value: i64,
    pub entity: u64,
}

impl ValueKey {
    #[must_use]
    pub const fn new(value: i64, entity: u64) -> Self {
        Self { value, entity }
    }
}

/// `(value i64, entity u64) -> ()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueLayout;

impl Layout for ValueLayout {
    type Key = ValueKey;
    type Value = ();

    fn identifier(&self) -> u64 {
        u64::from_le_bytes(*b"VALIDX01")
    }

    fn key_size(&self) -> usize {
        16
    }

    fn value_size(&self) -> usize {
        0
    }

    fn write_key(&self, key: &ValueKey, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&key.value.to_le_bytes());
        write_u64(buf, 8, key.entity);
    }

    fn read_key(&self, buf: &[u8]) -> ValueKey {
        let mut value = [0u8; 8];
        value.copy_from_slice(&buf[..8]);
        ValueKey::new(i64::from_le_bytes(value), read_u64(buf, 8))
    }

    fn write_value(&self, _value: &(), _buf: &mut [u8]) {}

    fn read_value(&self, _buf: &[u8]) {}

    fn compare(&self, left: &ValueKey, right: &ValueKey) -> Ordering {
        left.cmp(right)
    }
}

/// Predicate over indexed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueQuery {
    /// Value equals the given one.
    Exact(i64),
    /// Value lies between the bounds.
    Range { lower: Bound<i64>, upper: Bound<i64> },
    /// Any value.
    Exists,
}

impl ValueQuery {
    #[must_use]
    pub fn matches(&self, value: i64) -> bool {
        match self {
            Self::Exact(expected) => value == *expected,
            Self::Range { lower, upper } => (*lower, *upper).contains(&value),
            Self::Exists => true,
        }
    }

    #[must_use]
    pub const fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }

    /// Tree range covering every key whose value matches.
    fn seek_range(&self, order: IndexOrder) -> SeekRange<ValueKey> {
        let range = match *self {
            Self::Exact(value) => SeekRange::new(
                Bound::Included(ValueKey::new(value, 0)),
                Bound::Included(ValueKey::new(value, u64::MAX)),
            ),
            Self::Range { lower, upper } => SeekRange::new(
                match lower {
                    Bound::Included(v) => Bound::Included(ValueKey::new(v, 0)),
                    Bound::Excluded(v) => Bound::Excluded(ValueKey::new(v, u64::MAX)),
                    Bound::Unbounded => Bound::Unbounded,
                },
                match upper {
                    Bound::Included(v) => Bound::Included(ValueKey::new(v, u64::MAX)),
                    Bound::Excluded(v) => Bound::Excluded(ValueKey::new(v, 0)),
                    Bound::Unbounded => Bound::Unbounded,
                },
            ),
            Self::Exists => SeekRange::all(),
        };
        range.with_order(order)
    }
}

/// One entity's indexed value appearing or disappearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueChange {
    pub entity: u64,
    pub before: Option<i64>,
    pub after: Option<i64>,
}

/// A value index over one tree.
#[derive(Debug, Clone)]
pub struct ValueIndex {
    tree: Arc<GbpTree<ValueLayout>>,
}

impl ValueIndex {
    pub fn open(file: PagedFile, config: &EngineConfig) -> Result<Self, TreeError> {
        Ok(Self {
            tree: GbpTree::open(file, ValueLayout, config)?,
        })
    }

    /// Apply changes under one writer: the `before` entry goes, the `after`
    /// entry comes.
    pub fn apply(&self, changes: impl IntoIterator<Item = ValueChange>) -> Result<(), TreeError> {
        let mut writer = self.tree.writer();
        for change in changes {
            if let Some(before) = change.before {
                writer.remove(&ValueKey::new(before, change.entity))?;
            }
            if let Some(after) = change.after {
                writer.put(ValueKey::new(after, change.entity), ())?;
            }
        }
        Ok(())
    }

    /// Entities whose value satisfies `query`, ordered by `(value, entity)`.
    #[must_use]
    pub fn seek(&self, query: &ValueQuery, order: IndexOrder) -> ValueIndexProgressor {
        ValueIndexProgressor {
            seeker: self.tree.seek(query.seek_range(order)),
            current: None,
            closed: false,
        }
    }

    pub fn checkpoint(&self) -> Result<(), TreeError> {
        self.tree.checkpoint()
    }

    pub fn close(&self) -> Result<(), TreeError> {
        self.tree.close()
    }
}

pub struct ValueIndexProgressor {
    seeker: TreeSeeker<ValueLayout>,
    current: Option<ValueKey>,
    closed: bool,
}

impl ValueIndexProgressor {
    /// Value of the current hit.
    #[must_use]
    pub fn value(&self) -> Option<i64> {
        self.current.map(|key| key.value)
    }

    /// Current hit as `(value, entity)`.
    #[must_use]
    pub const fn hit(&self) -> Option<ValueKey> {
        self.current
    }
}

impl IndexProgressor for ValueIndexProgressor {
    fn next(&mut self) -> Result<bool, TreeError> {
        if self.closed {
            return Ok(false);
        }
        self.current = if self.seeker.next()? {
            self.seeker.key().copied()
        } else {
            None
        };
        Ok(self.current.is_some())
    }

    fn entity(&self) -> u64 {
        self.current.map_or(NO_ENTITY, |key| key.entity)
    }

    fn close(&mut self) -> Result<(), TreeError> {
        if !self.closed {
            self.closed = true;
            self.current = None;
            self.seeker.close()?;
        }
        Ok(())
    }
}
