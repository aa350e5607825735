//! The single tree writer.
//!
//! A node of the unstable generation is changed in place. Any older node
//! belongs to a checkpoint and is copied instead: the copy gets a fresh page
//! and the unstable generation, the old page gets a successor link to it, and
//! the parent is updated to point at the copy, which may copy the parent in
//! turn. A copied root is published in memory and reaches the state slots at
//! the next checkpoint.
//!
//! An overflowing node splits in half. The left half keeps the node's page
//! (or its copy), the right half goes to a new page.
//!
//! # Write Order
//!
//! 1. New pages (copies, right halves)
//! 2. Successor link on the replaced page
//! 3. Sibling links of unstable neighbours
//! 4. Parent, or a new root published last
//!
//! A seeker reading between any two steps sees either the old version of a
//! node or reaches the new one through a successor or right link.
//!
//! Sibling links in checkpointed neighbours are never patched; readers
//! resolve them through successor links. Nodes are never merged or freed;
//! removals can leave empty leaves behind.

use std::cmp::Ordering;

use parking_lot::MutexGuard;
use tracing::debug;

use crate::index::layout::Layout;
use crate::index::node::{InternalNode, LeafNode, Node, Pointer, offsets};
use crate::index::tree::{GbpTree, TreeError, WriterState};
use crate::pagecache::{PageId, ReadPageCursor};

/// Ancestors of the leaf being modified: `(page, node, child slot taken)`.
type Path<K> = Vec<(PageId, InternalNode<K>, usize)>;

/// Exclusive write access to one tree. Dropping it releases the writer lock.
pub struct TreeWriter<'a, L: Layout> {
    tree: &'a GbpTree<L>,
    state: MutexGuard<'a, WriterState>,
    cursor: ReadPageCursor,
    buf: Vec<u8>,
}

impl<'a, L: Layout> TreeWriter<'a, L> {
    pub(crate) fn new(tree: &'a GbpTree<L>, state: MutexGuard<'a, WriterState>) -> Self {
        Self {
            tree,
            state,
            cursor: tree.file().read_cursor(0),
            buf: vec![0u8; tree.format().page_size()],
        }
    }

    /// Insert or overwrite. Returns the previous value.
    pub fn put(&mut self, key: L::Key, value: L::Value) -> Result<Option<L::Value>, TreeError> {
        self.update(key, |_| Some(value))
    }

    /// Remove `key`. Returns the removed value.
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>, TreeError> {
        self.update(key.clone(), |_| None)
    }

    /// Replace the entry for `key` with whatever `update` makes of the current
    /// value: `Some` stores, `None` removes (or leaves the key absent).
    ///
    /// Returns the value that was stored before.
    ///
    /// # Errors
    ///
    /// `TreeError::Inconsistency` if a pointer on the way down does not match
    /// the generation of its target.
    pub fn update(
        &mut self,
        key: L::Key,
        update: impl FnOnce(Option<&L::Value>) -> Option<L::Value>,
    ) -> Result<Option<L::Value>, TreeError> {
        let tree = self.tree;
        let layout = tree.layout();
        let mut path: Path<L::Key> = Vec::new();
        let mut pointer = tree.root();

        let (leaf_id, mut leaf) = loop {
            let Some((page_id, node)) = tree.resolve(&mut self.cursor, pointer, &mut self.buf)? else {
                return Err(TreeError::Inconsistency(format!(
                    "pointer to page {} expects generation {}, node differs",
                    pointer.id, pointer.generation
                )));
            };
            match node {
                Node::Internal(internal) => {
                    let slot = internal
                        .keys
                        .partition_point(|sep| layout.compare(sep, &key) != Ordering::Greater);
                    pointer = internal.children[slot];
                    path.push((page_id, internal, slot));
                }
                Node::Leaf(leaf) => break (page_id, leaf),
            }
        };

        let search = leaf.keys.binary_search_by(|existing| layout.compare(existing, &key));
        let previous = search.ok().map(|i| leaf.values[i].clone());
        match (search, update(previous.as_ref())) {
            (Ok(i), Some(value)) => {
                leaf.values[i] = value;
                self.store_child(&mut path, leaf_id, Node::Leaf(leaf))?;
            }
            (Ok(i), None) => {
                leaf.keys.remove(i);
                leaf.values.remove(i);
                self.store_child(&mut path, leaf_id, Node::Leaf(leaf))?;
            }
            (Err(_), None) => {}
            (Err(i), Some(value)) => {
                leaf.keys.insert(i, key);
                leaf.values.insert(i, value);
                if leaf.keys.len() <= tree.format().leaf_capacity() {
                    self.store_child(&mut path, leaf_id, Node::Leaf(leaf))?;
                } else {
                    self.split_leaf(&mut path, leaf_id, leaf)?;
                }
            }
        }
        Ok(previous)
    }

    /// Write `node`, read from `page_id`, and point its parent at wherever it
    /// ended up.
    fn store_child(
        &mut self,
        path: &mut Path<L::Key>,
        page_id: PageId,
        node: Node<L::Key, L::Value>,
    ) -> Result<(), TreeError> {
        let stored = self.store(page_id, node)?;
        if stored == page_id {
            return Ok(());
        }
        self.replace_child(path, Pointer::new(stored, self.state.unstable))
    }

    /// Write `node` in place if it is unstable, otherwise to a copy.
    ///
    /// Returns the page now holding the node.
    fn store(&mut self, page_id: PageId, mut node: Node<L::Key, L::Value>) -> Result<PageId, TreeError> {
        let generation = self.state.unstable;
        if node.generation() == generation {
            self.write_node(page_id, &node)?;
            return Ok(page_id);
        }
        let (left, right) = node.siblings();
        let left = self.newest(left)?;
        let right = self.newest(right)?;
        let copy_id = self.allocate();
        node.restamp(generation, left, right);
        self.write_node(copy_id, &node)?;
        self.link_successor(page_id, copy_id)?;
        self.patch_sibling(left, offsets::RIGHT_ID, copy_id)?;
        self.patch_sibling(right, offsets::LEFT_ID, copy_id)?;
        Ok(copy_id)
    }

    /// Point the last parent on `path` at `child`, copying ancestors as needed.
    fn replace_child(&mut self, path: &mut Path<L::Key>, child: Pointer) -> Result<(), TreeError> {
        let Some((parent_id, mut parent, slot)) = path.pop() else {
            self.tree.publish_root(child);
            debug!(root = child.id, generation = child.generation, "published copied root");
            return Ok(());
        };
        if parent.children[slot] == child {
            return Ok(());
        }
        parent.children[slot] = child;
        self.store_child(path, parent_id, Node::Internal(parent))
    }

    fn split_leaf(
        &mut self,
        path: &mut Path<L::Key>,
        leaf_id: PageId,
        mut leaf: LeafNode<L::Key, L::Value>,
    ) -> Result<(), TreeError> {
        let generation = self.state.unstable;
        let target = self.split_target(leaf_id, leaf.generation, leaf.left, leaf.right)?;
        let mid = leaf.keys.len() / 2;
        let right = LeafNode {
            generation,
            left: Pointer::new(target.left_id, generation),
            right: target.right_neighbour,
            successor: Pointer::NULL,
            keys: leaf.keys.split_off(mid),
            values: leaf.values.split_off(mid),
        };
        leaf.generation = generation;
        leaf.left = target.left_neighbour;
        leaf.right = Pointer::new(target.right_id, generation);
        leaf.successor = Pointer::NULL;

        let separator = right.keys[0].clone();
        self.write_node(target.right_id, &Node::Leaf(right))?;
        self.write_node(target.left_id, &Node::Leaf(leaf))?;
        self.finish_split(leaf_id, &target)?;
        self.insert_into_parent(
            path,
            Pointer::new(target.left_id, generation),
            separator,
            Pointer::new(target.right_id, generation),
        )
    }

    fn insert_into_parent(
        &mut self,
        path: &mut Path<L::Key>,
        left: Pointer,
        separator: L::Key,
        right: Pointer,
    ) -> Result<(), TreeError> {
        let generation = self.state.unstable;
        let Some((parent_id, mut parent, slot)) = path.pop() else {
            let root_id = self.allocate();
            let root = InternalNode {
                generation,
                left: Pointer::NULL,
                right: Pointer::NULL,
                successor: Pointer::NULL,
                keys: vec![separator],
                children: vec![left, right],
            };
            self.write_node(root_id, &Node::Internal(root))?;
            self.tree.publish_root(Pointer::new(root_id, generation));
            debug!(root = root_id, "tree grew a level");
            return Ok(());
        };

        parent.children[slot] = left;
        parent.keys.insert(slot, separator);
        parent.children.insert(slot + 1, right);
        if parent.keys.len() <= self.tree.format().internal_capacity() {
            return self.store_child(path, parent_id, Node::Internal(parent));
        }

        let target = self.split_target(parent_id, parent.generation, parent.left, parent.right)?;
        let mid = parent.keys.len() / 2;
        let mut right_keys = parent.keys.split_off(mid);
        let promoted = right_keys.remove(0);
        let sibling = InternalNode {
            generation,
            left: Pointer::new(target.left_id, generation),
            right: target.right_neighbour,
            successor: Pointer::NULL,
            keys: right_keys,
            children: parent.children.split_off(mid + 1),
        };
        parent.generation = generation;
        parent.left = target.left_neighbour;
        parent.right = Pointer::new(target.right_id, generation);
        parent.successor = Pointer::NULL;

        self.write_node(target.right_id, &Node::Internal(sibling))?;
        self.write_node(target.left_id, &Node::Internal(parent))?;
        self.finish_split(parent_id, &target)?;
        self.insert_into_parent(
            path,
            Pointer::new(target.left_id, generation),
            promoted,
            Pointer::new(target.right_id, generation),
        )
    }

    /// Pick the pages for the halves of a node about to split.
    fn split_target(
        &mut self,
        page_id: PageId,
        node_generation: u64,
        left: Pointer,
        right: Pointer,
    ) -> Result<SplitTarget, TreeError> {
        let copied = node_generation != self.state.unstable;
        let (left_id, left_neighbour, right_neighbour) = if copied {
            let left = self.newest(left)?;
            let right = self.newest(right)?;
            (self.allocate(), left, right)
        } else {
            (page_id, left, right)
        };
        Ok(SplitTarget {
            copied,
            left_id,
            right_id: self.allocate(),
            left_neighbour,
            right_neighbour,
        })
    }

    /// Link the replaced page and the neighbours to the freshly written halves.
    fn finish_split(&self, page_id: PageId, target: &SplitTarget) -> Result<(), TreeError> {
        if target.copied {
            self.link_successor(page_id, target.left_id)?;
            self.patch_sibling(target.left_neighbour, offsets::RIGHT_ID, target.left_id)?;
        }
        self.patch_sibling(target.right_neighbour, offsets::LEFT_ID, target.right_id)
    }

    /// Pointer to the newest version of whatever `pointer` refers to.
    fn newest(&mut self, pointer: Pointer) -> Result<Pointer, TreeError> {
        if pointer.is_null() {
            return Ok(pointer);
        }
        match self.tree.resolve(&mut self.cursor, pointer, &mut self.buf)? {
            Some((page_id, node)) => Ok(Pointer::new(page_id, node.generation())),
            None => Err(TreeError::Inconsistency(format!(
                "sibling pointer to page {} expects generation {}, node differs",
                pointer.id, pointer.generation
            ))),
        }
    }

    fn link_successor(&self, page_id: PageId, copy_id: PageId) -> Result<(), TreeError> {
        self.tree.patch_pointer(
            page_id,
            offsets::SUCCESSOR_ID,
            Pointer::new(copy_id, self.state.unstable),
        )
    }

    /// Rewrite one sibling link of `neighbour`. Checkpointed neighbours are
    /// left alone.
    fn patch_sibling(&self, neighbour: Pointer, offset: usize, target: PageId) -> Result<(), TreeError> {
        let generation = self.state.unstable;
        if neighbour.is_null() || neighbour.generation != generation {
            return Ok(());
        }
        self.tree
            .patch_pointer(neighbour.id, offset, Pointer::new(target, generation))
    }

    fn allocate(&mut self) -> PageId {
        self.state.last_id += 1;
        self.state.last_id
    }

    fn write_node(&self, page_id: PageId, node: &Node<L::Key, L::Value>) -> Result<(), TreeError> {
        let bytes = self.tree.format().encode(self.tree.layout(), node);
        self.tree.write_page(page_id, &bytes)
    }
}

/// Pages involved in one split.
struct SplitTarget {
    /// The node was checkpointed, so its left half goes to a copy.
    copied: bool,
    left_id: PageId,
    right_id: PageId,
    left_neighbour: Pointer,
    right_neighbour: Pointer,
}
