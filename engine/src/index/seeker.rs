//! Range seekers over a tree.
//!
//! A seeker descends from the root to the leaf holding the first key of its
//! range, then walks leaves through their sibling links. It keeps a decoded
//! copy of the current leaf, so it never holds a page lock between calls.
//!
//! Every hop resolves the pointer to the newest version of its target by
//! following successor links, so a pointer into a checkpointed node still
//! leads to the current copy. Walking left, the seeker moves right from the
//! resolved neighbour until it finds the leaf whose right link leads back,
//! which steps over halves split off in between.
//!
//! A generation mismatch, or a left walk that never finds its way back, sends
//! the seeker back to the root with its range narrowed to start after the
//! last key it returned. Too many restarts in a row without returning a key
//! is a tree inconsistency.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use tracing::trace;

use crate::index::IndexOrder;
use crate::index::layout::Layout;
use crate::index::node::{LeafNode, Node, Pointer};
use crate::index::tree::{GbpTree, TreeError};
use crate::pagecache::{PageCursor, PageId, ReadPageCursor};

/// An ordered cursor over tree entries.
pub trait Seeker {
    type Key;
    type Value;

    /// Move to the next entry.
    ///
    /// # Returns
    /// - `Ok(false)` once the range is exhausted or the seeker closed
    fn next(&mut self) -> Result<bool, TreeError>;

    /// Key of the current entry, `None` unless the last `next()` returned
    /// `true`.
    fn key(&self) -> Option<&Self::Key>;

    /// Value of the current entry, `None` unless the last `next()` returned
    /// `true`.
    fn value(&self) -> Option<&Self::Value>;

    /// Release resources. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), TreeError>;
}

/// Bounds and direction of a seek.
#[derive(Debug, Clone)]
pub struct SeekRange<K> {
    pub lower: Bound<K>,
    pub upper: Bound<K>,
    pub order: IndexOrder,
}

impl<K> SeekRange<K> {
    /// Ascending range between two bounds.
    #[must_use]
    pub const fn new(lower: Bound<K>, upper: Bound<K>) -> Self {
        Self {
            lower,
            upper,
            order: IndexOrder::Ascending,
        }
    }

    /// `[from, to)`, ascending.
    #[must_use]
    pub const fn half_open(from: K, to: K) -> Self {
        Self::new(Bound::Included(from), Bound::Excluded(to))
    }

    #[must_use]
    pub const fn all() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// Same bounds, visited in `order`.
    #[must_use]
    pub fn with_order(self, order: IndexOrder) -> Self {
        Self { order, ..self }
    }
}

fn below_lower<L: Layout>(layout: &L, lower: &Bound<L::Key>, key: &L::Key) -> bool {
    match lower {
        Bound::Unbounded => false,
        Bound::Included(bound) => layout.compare(key, bound) == Ordering::Less,
        Bound::Excluded(bound) => layout.compare(key, bound) != Ordering::Greater,
    }
}

fn above_upper<L: Layout>(layout: &L, upper: &Bound<L::Key>, key: &L::Key) -> bool {
    match upper {
        Bound::Unbounded => false,
        Bound::Included(bound) => layout.compare(key, bound) == Ordering::Greater,
        Bound::Excluded(bound) => layout.compare(key, bound) != Ordering::Less,
    }
}

/// Decoded leaf plus the position of the next entry to visit.
///
/// Ascending seeks visit `keys[pos]` next; descending seeks `keys[pos - 1]`.
struct LeafView<K, V> {
    page_id: PageId,
    left: Pointer,
    right: Pointer,
    keys: Vec<K>,
    values: Vec<V>,
    pos: usize,
}

impl<K, V> LeafView<K, V> {
    fn new(page_id: PageId, leaf: LeafNode<K, V>, pos: usize) -> Self {
        Self {
            page_id,
            left: leaf.left,
            right: leaf.right,
            keys: leaf.keys,
            values: leaf.values,
            pos,
        }
    }
}

/// Seeker over one tree.
pub struct TreeSeeker<L: Layout> {
    tree: Arc<GbpTree<L>>,
    cursor: ReadPageCursor,
    range: SeekRange<L::Key>,
    leaf: Option<LeafView<L::Key, L::Value>>,
    current: Option<(L::Key, L::Value)>,
    buf: Vec<u8>,
    restarts: u32,
    /// Restarts since the last returned entry.
    stalled: u32,
    exhausted: bool,
    closed: bool,
}

impl<L: Layout> TreeSeeker<L> {
    pub(crate) fn new(tree: Arc<GbpTree<L>>, range: SeekRange<L::Key>) -> Self {
        let cursor = tree.file().read_cursor(0);
        let buf = vec![0u8; tree.format().page_size()];
        Self {
            tree,
            cursor,
            range,
            leaf: None,
            current: None,
            buf,
            restarts: 0,
            stalled: 0,
            exhausted: false,
            closed: false,
        }
    }

    /// Times this seeker went back to the root.
    #[must_use]
    pub const fn restarts(&self) -> u32 {
        self.restarts
    }

    const fn descending(&self) -> bool {
        matches!(self.range.order, IndexOrder::Descending)
    }

    fn finish(&mut self) -> bool {
        self.exhausted = true;
        self.current = None;
        self.leaf = None;
        false
    }

    fn restart(&mut self) -> Result<(), TreeError> {
        self.restarts += 1;
        self.stalled += 1;
        if self.stalled > self.tree.restart_limit() {
            return Err(TreeError::Inconsistency(format!(
                "seek restarted {} times without reaching a stable leaf",
                self.stalled
            )));
        }
        trace!(restarts = self.restarts, "generation changed under seeker, restarting");
        if let Some((key, _)) = &self.current {
            if self.descending() {
                self.range.upper = Bound::Excluded(key.clone());
            } else {
                self.range.lower = Bound::Excluded(key.clone());
            }
        }
        self.leaf = None;
        Ok(())
    }

    /// Index of the first leaf entry a fresh descent should visit.
    fn start_position(&self, keys: &[L::Key]) -> usize {
        let layout = self.tree.layout();
        if self.descending() {
            keys.partition_point(|k| !above_upper(layout, &self.range.upper, k))
        } else {
            keys.partition_point(|k| below_lower(layout, &self.range.lower, k))
        }
    }

    fn child_slot(&self, separators: &[L::Key]) -> usize {
        let layout = self.tree.layout();
        let bound = if self.descending() {
            &self.range.upper
        } else {
            &self.range.lower
        };
        match bound {
            Bound::Unbounded if self.descending() => separators.len(),
            Bound::Unbounded => 0,
            Bound::Excluded(key) if self.descending() => {
                separators.partition_point(|sep| layout.compare(sep, key) == Ordering::Less)
            }
            Bound::Included(key) | Bound::Excluded(key) => {
                separators.partition_point(|sep| layout.compare(sep, key) != Ordering::Greater)
            }
        }
    }

    /// Descend from the root to the leaf where the range starts.
    fn descend(&mut self) -> Result<(), TreeError> {
        let mut pointer = self.tree.root();
        loop {
            let Some((page_id, node)) = self
                .tree
                .resolve(&mut self.cursor, pointer, &mut self.buf)?
            else {
                return self.restart();
            };
            match node {
                Node::Internal(internal) => {
                    pointer = internal.children[self.child_slot(&internal.keys)];
                }
                Node::Leaf(leaf) => {
                    let pos = self.start_position(&leaf.keys);
                    self.leaf = Some(LeafView::new(page_id, leaf, pos));
                    return if self.descending() {
                        self.walk_right()
                    } else {
                        Ok(())
                    };
                }
            }
        }
    }

    /// Descending seeks can land left of the upper bound after a concurrent
    /// split moved keys into a right sibling; follow right links while the
    /// neighbour still starts inside the range.
    fn walk_right(&mut self) -> Result<(), TreeError> {
        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(());
            };
            if leaf.right.is_null() || leaf.pos < leaf.keys.len() {
                return Ok(());
            }
            let right = leaf.right;
            match self.tree.resolve(&mut self.cursor, right, &mut self.buf)? {
                Some((page_id, Node::Leaf(next))) => {
                    let pos = self.start_position(&next.keys);
                    if pos == 0 && !next.keys.is_empty() {
                        return Ok(());
                    }
                    self.leaf = Some(LeafView::new(page_id, next, pos));
                }
                _ => return self.restart(),
            }
        }
    }

    /// Move to the sibling after the current leaf is used up.
    fn follow(&mut self, sibling: Pointer, came_from: PageId) -> Result<(), TreeError> {
        let Some((mut page_id, mut node)) =
            self.tree.resolve(&mut self.cursor, sibling, &mut self.buf)?
        else {
            return self.restart();
        };
        if !self.descending() {
            return match node {
                Node::Leaf(leaf) => {
                    self.leaf = Some(LeafView::new(page_id, leaf, 0));
                    Ok(())
                }
                Node::Internal(_) => self.restart(),
            };
        }

        // Splits to the left of `came_from` put new leaves between it and the
        // neighbour its left link names.
        loop {
            let Node::Leaf(leaf) = node else {
                return self.restart();
            };
            if self
                .tree
                .reaches(&mut self.cursor, leaf.right, came_from, &mut self.buf)?
            {
                let pos = leaf.keys.len();
                self.leaf = Some(LeafView::new(page_id, leaf, pos));
                return Ok(());
            }
            let passed = match (&self.current, leaf.keys.first()) {
                (Some((last, _)), Some(first)) => {
                    self.tree.layout().compare(first, last) != Ordering::Less
                }
                _ => false,
            };
            if passed || leaf.right.is_null() {
                return self.restart();
            }
            match self.tree.resolve(&mut self.cursor, leaf.right, &mut self.buf)? {
                Some((next_id, next)) if next_id != came_from => {
                    page_id = next_id;
                    node = next;
                }
                _ => return self.restart(),
            }
        }
    }
}

impl<L: Layout> Seeker for TreeSeeker<L> {
    type Key = L::Key;
    type Value = L::Value;

    fn next(&mut self) -> Result<bool, TreeError> {
        if self.closed || self.exhausted {
            return Ok(false);
        }
        let descending = self.descending();
        loop {
            let Some(leaf) = self.leaf.as_mut() else {
                self.descend()?;
                continue;
            };
            let layout = self.tree.layout();

            if descending {
                while leaf.pos > 0 {
                    leaf.pos -= 1;
                    let key = &leaf.keys[leaf.pos];
                    if above_upper(layout, &self.range.upper, key) {
                        continue;
                    }
                    if below_lower(layout, &self.range.lower, key) {
                        return Ok(self.finish());
                    }
                    self.current = Some((key.clone(), leaf.values[leaf.pos].clone()));
                    self.stalled = 0;
                    return Ok(true);
                }
            } else {
                while leaf.pos < leaf.keys.len() {
                    let key = &leaf.keys[leaf.pos];
                    leaf.pos += 1;
                    if below_lower(layout, &self.range.lower, key) {
                        continue;
                    }
                    if above_upper(layout, &self.range.upper, key) {
                        return Ok(self.finish());
                    }
                    self.current = Some((key.clone(), leaf.values[leaf.pos - 1].clone()));
                    self.stalled = 0;
                    return Ok(true);
                }
            }

            let sibling = if descending { leaf.left } else { leaf.right };
            let came_from = leaf.page_id;
            if sibling.is_null() {
                return Ok(self.finish());
            }
            self.follow(sibling, came_from)?;
        }
    }

    fn key(&self) -> Option<&L::Key> {
        self.current.as_ref().map(|(key, _)| key)
    }

    fn value(&self) -> Option<&L::Value> {
        self.current.as_ref().map(|(_, value)| value)
    }

    fn close(&mut self) -> Result<(), TreeError> {
        if !self.closed {
            self.closed = true;
            self.leaf = None;
            self.current = None;
            self.cursor.close();
        }
        Ok(())
    }
}
