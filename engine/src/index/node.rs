//! Tree node pages.
//!
//! # Page Layout
//!
//! ```text
//! +------+-----------------------------+------+
//! | off  | field                       | size |
//! +------+-----------------------------+------+
//! |    0 | node type (1 leaf, 2 inner) |    1 |
//! |    8 | generation                  |    8 |
//! |   16 | key count                   |    4 |
//! |   24 | right sibling id            |    8 |
//! |   32 | right sibling generation    |    8 |
//! |   40 | left sibling id             |    8 |
//! |   48 | left sibling generation     |    8 |
//! |   56 | successor id                |    8 |
//! |   64 | successor generation        |    8 |
//! |   72 | body                        |  ... |
//! +------+-----------------------------+------+
//! ```
//!
//! Leaf body: `count` entries of `key || value`.
//! Internal body: `capacity` key slots, then `capacity + 1` child pointers of
//! `(id u64, generation u64)`.
//!
//! Every pointer carries the generation its target had when the pointer was
//! written. A node's generation never changes after the node is written, so
//! a mismatch means the pointer is damaged or refers to a reused page.
//!
//! A node of an older generation is never rewritten. Its replacement goes to
//! a fresh page and the old page's successor link points there. Readers
//! arriving through a stale pointer follow successor links to the newest
//! version.

use crate::index::layout::{Layout, read_u32, read_u64, write_u32, write_u64};
use crate::index::TreeError;
use crate::pagecache::PageId;

/// Page id meaning "no node". Page 0 is the meta page, never a node.
pub const NO_NODE: PageId = 0;

pub(crate) mod offsets {
    pub const NODE_TYPE: usize = 0;
    pub const GENERATION: usize = 8;
    pub const KEY_COUNT: usize = 16;
    pub const RIGHT_ID: usize = 24;
    pub const RIGHT_GENERATION: usize = 32;
    pub const LEFT_ID: usize = 40;
    pub const LEFT_GENERATION: usize = 48;
    pub const SUCCESSOR_ID: usize = 56;
    pub const SUCCESSOR_GENERATION: usize = 64;
    pub const BODY: usize = 72;
}

const LEAF: u8 = 1;
const INTERNAL: u8 = 2;
const POINTER_SIZE: usize = 16;

/// A generation-stamped reference to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pointer {
    pub id: PageId,
    pub generation: u64,
}

impl Pointer {
    pub const NULL: Self = Self {
        id: NO_NODE,
        generation: 0,
    };

    #[must_use]
    pub const fn new(id: PageId, generation: u64) -> Self {
        Self { id, generation }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.id == NO_NODE
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LeafNode<K, V> {
    pub generation: u64,
    pub left: Pointer,
    pub right: Pointer,
    pub successor: Pointer,
    pub keys: Vec<K>,
    pub values: Vec<V>,
}

/// Separator `keys[i]` is the smallest key reachable through `children[i + 1]`.
#[derive(Debug, Clone)]
pub(crate) struct InternalNode<K> {
    pub generation: u64,
    pub left: Pointer,
    pub right: Pointer,
    pub successor: Pointer,
    pub keys: Vec<K>,
    pub children: Vec<Pointer>,
}

#[derive(Debug, Clone)]
pub(crate) enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Internal(InternalNode<K>),
}

impl<K, V> Node<K, V> {
    pub(crate) const fn generation(&self) -> u64 {
        match self {
            Self::Leaf(leaf) => leaf.generation,
            Self::Internal(internal) => internal.generation,
        }
    }

    /// Newer version of this node, `Pointer::NULL` if this is the newest.
    pub(crate) const fn successor(&self) -> Pointer {
        match self {
            Self::Leaf(leaf) => leaf.successor,
            Self::Internal(internal) => internal.successor,
        }
    }

    /// `(left, right)` sibling pointers.
    pub(crate) const fn siblings(&self) -> (Pointer, Pointer) {
        match self {
            Self::Leaf(leaf) => (leaf.left, leaf.right),
            Self::Internal(internal) => (internal.left, internal.right),
        }
    }

    /// Turn this node into a fresh version of `generation` with new sibling
    /// links and no successor.
    pub(crate) const fn restamp(&mut self, generation: u64, left: Pointer, right: Pointer) {
        match self {
            Self::Leaf(leaf) => {
                leaf.generation = generation;
                leaf.left = left;
                leaf.right = right;
                leaf.successor = Pointer::NULL;
            }
            Self::Internal(internal) => {
                internal.generation = generation;
                internal.left = left;
                internal.right = right;
                internal.successor = Pointer::NULL;
            }
        }
    }
}

/// Sizes derived from the page size and a layout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeFormat {
    page_size: usize,
    key_size: usize,
    value_size: usize,
}

impl NodeFormat {
    /// Smallest number of keys a node must hold for splits to make sense.
    const MIN_CAPACITY: usize = 3;

    pub(crate) fn new<L: Layout>(layout: &L, page_size: usize) -> Result<Self, TreeError> {
        let format = Self {
            page_size,
            key_size: layout.key_size(),
            value_size: layout.value_size(),
        };
        if format.leaf_capacity() < Self::MIN_CAPACITY
            || format.internal_capacity() < Self::MIN_CAPACITY
        {
            return Err(TreeError::LayoutTooLarge {
                page_size,
                key_size: format.key_size,
                value_size: format.value_size,
            });
        }
        Ok(format)
    }

    pub(crate) const fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) const fn leaf_capacity(&self) -> usize {
        (self.page_size - offsets::BODY) / (self.key_size + self.value_size)
    }

    pub(crate) const fn internal_capacity(&self) -> usize {
        (self.page_size - offsets::BODY - POINTER_SIZE) / (self.key_size + POINTER_SIZE)
    }

    const fn child_offset(&self, index: usize) -> usize {
        offsets::BODY + self.internal_capacity() * self.key_size + index * POINTER_SIZE
    }

    /// Decode a page image.
    ///
    /// # Errors
    ///
    /// `TreeError::Inconsistency` if the page is not a well-formed node.
    pub(crate) fn decode<L: Layout>(
        &self,
        layout: &L,
        page_id: PageId,
        buf: &[u8],
    ) -> Result<Node<L::Key, L::Value>, TreeError> {
        let generation = read_u64(buf, offsets::GENERATION);
        let count = read_u32(buf, offsets::KEY_COUNT) as usize;
        let right = Pointer::new(
            read_u64(buf, offsets::RIGHT_ID),
            read_u64(buf, offsets::RIGHT_GENERATION),
        );
        let left = Pointer::new(
            read_u64(buf, offsets::LEFT_ID),
            read_u64(buf, offsets::LEFT_GENERATION),
        );
        let successor = Pointer::new(
            read_u64(buf, offsets::SUCCESSOR_ID),
            read_u64(buf, offsets::SUCCESSOR_GENERATION),
        );

        match buf[offsets::NODE_TYPE] {
            LEAF => {
                if count > self.leaf_capacity() {
                    return Err(bad_count(page_id, count));
                }
                let entry = self.key_size + self.value_size;
                let mut keys = Vec::with_capacity(count);
                let mut values = Vec::with_capacity(count);
                for i in 0..count {
                    let at = offsets::BODY + i * entry;
                    keys.push(layout.read_key(&buf[at..at + self.key_size]));
                    values.push(layout.read_value(&buf[at + self.key_size..at + entry]));
                }
                Ok(Node::Leaf(LeafNode {
                    generation,
                    left,
                    right,
                    successor,
                    keys,
                    values,
                }))
            }
            INTERNAL => {
                if count == 0 || count > self.internal_capacity() {
                    return Err(bad_count(page_id, count));
                }
                let keys = (0..count)
                    .map(|i| {
                        let at = offsets::BODY + i * self.key_size;
                        layout.read_key(&buf[at..at + self.key_size])
                    })
                    .collect();
                let children = (0..=count)
                    .map(|i| {
                        let at = self.child_offset(i);
                        Pointer::new(read_u64(buf, at), read_u64(buf, at + 8))
                    })
                    .collect();
                Ok(Node::Internal(InternalNode {
                    generation,
                    left,
                    right,
                    successor,
                    keys,
                    children,
                }))
            }
            other => Err(TreeError::Inconsistency(format!(
                "page {page_id} has unknown node type {other}"
            ))),
        }
    }

    pub(crate) fn encode<L: Layout>(&self, layout: &L, node: &Node<L::Key, L::Value>) -> Vec<u8> {
        match node {
            Node::Leaf(leaf) => self.encode_leaf(layout, leaf),
            Node::Internal(internal) => self.encode_internal(layout, internal),
        }
    }

    pub(crate) fn encode_leaf<L: Layout>(
        &self,
        layout: &L,
        leaf: &LeafNode<L::Key, L::Value>,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; self.page_size];
        write_header(&mut buf, LEAF, leaf.generation, leaf.keys.len(), [leaf.left, leaf.right, leaf.successor]);
        let entry = self.key_size + self.value_size;
        for (i, (key, value)) in leaf.keys.iter().zip(&leaf.values).enumerate() {
            let at = offsets::BODY + i * entry;
            layout.write_key(key, &mut buf[at..at + self.key_size]);
            layout.write_value(value, &mut buf[at + self.key_size..at + entry]);
        }
        buf
    }

    pub(crate) fn encode_internal<L: Layout>(
        &self,
        layout: &L,
        node: &InternalNode<L::Key>,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; self.page_size];
        write_header(
            &mut buf,
            INTERNAL,
            node.generation,
            node.keys.len(),
            [node.left, node.right, node.successor],
        );
        for (i, key) in node.keys.iter().enumerate() {
            let at = offsets::BODY + i * self.key_size;
            layout.write_key(key, &mut buf[at..at + self.key_size]);
        }
        for (i, child) in node.children.iter().enumerate() {
            let at = self.child_offset(i);
            write_u64(&mut buf, at, child.id);
            write_u64(&mut buf, at + 8, child.generation);
        }
        buf
    }
}

/// `links` are `[left, right, successor]`.
fn write_header(buf: &mut [u8], node_type: u8, generation: u64, count: usize, links: [Pointer; 3]) {
    let [left, right, successor] = links;
    buf[offsets::NODE_TYPE] = node_type;
    write_u64(buf, offsets::GENERATION, generation);
    #[allow(clippy::cast_possible_truncation)] // bounded by node capacity
    write_u32(buf, offsets::KEY_COUNT, count as u32);
    write_u64(buf, offsets::RIGHT_ID, right.id);
    write_u64(buf, offsets::RIGHT_GENERATION, right.generation);
    write_u64(buf, offsets::LEFT_ID, left.id);
    write_u64(buf, offsets::LEFT_GENERATION, left.generation);
    write_u64(buf, offsets::SUCCESSOR_ID, successor.id);
    write_u64(buf, offsets::SUCCESSOR_GENERATION, successor.generation);
}

fn bad_count(page_id: PageId, count: usize) -> TreeError {
    TreeError::Inconsistency(format!("page {page_id} claims {count} keys"))
}
