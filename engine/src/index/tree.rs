//! Generation-stamped B+tree over a paged file.
//!
//! # File Layout
//!
//! ```text
//! page 0      meta: magic, format version, page size, layout identity
//! page 1      tree state slot A
//! page 2      tree state slot B
//! page 3..    nodes
//! ```
//!
//! # Generations
//!
//! Every checkpoint turns the unstable generation into the stable one and
//! opens a new unstable generation. Nodes of the unstable generation are
//! modified in place. A node of an older generation is part of a checkpoint:
//! the writer copies it to a fresh page instead, links the old page to the
//! copy through its successor pointer and copies the parents up to a new
//! root. The root only reaches the state slots at the next checkpoint.
//!
//! # Crash Recovery
//!
//! Between checkpoints the only bytes written to checkpointed pages are
//! successor links. Opening a tree that was not closed cleanly clears every
//! successor link newer than the stable generation, which restores the image
//! the newest state slot describes.
//!
//! # Concurrency
//!
//! - One writer at a time, serialized by a mutex
//! - Any number of seekers, reading pages optimistically through the cache
//! - The root pointer is published through a read-write lock

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::index::layout::{Layout, read_u32, read_u64, write_u32, write_u64};
use crate::index::node::{LeafNode, Node, NodeFormat, Pointer, offsets};
use crate::index::seeker::{SeekRange, TreeSeeker};
use crate::index::tree_state::{
    Slot, TreeState, select_newest_valid_state, select_oldest_or_invalid,
};
use crate::index::writer::TreeWriter;
use crate::pagecache::{PageCacheError, PageCursor, PageId, PagedFile, ReadPageCursor};

/// Errors raised by trees and their seekers.
#[derive(Debug)]
pub enum TreeError {
    /// Page cache or storage failure.
    PageCache(PageCacheError),
    /// The tree is structurally broken and cannot be repaired by retrying.
    Inconsistency(String),
    /// The meta page is not one this code wrote.
    InvalidMeta(String),
    /// The file was written with a different layout.
    LayoutMismatch { expected: u64, found: u64 },
    /// A node page cannot hold enough entries of this layout.
    LayoutTooLarge {
        page_size: usize,
        key_size: usize,
        value_size: usize,
    },
    /// Several parts of a combined seeker failed to close.
    MultipleCloseFailures {
        first: Box<TreeError>,
        suppressed: Vec<TreeError>,
    },
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PageCache(e) => write!(f, "tree page cache error: {e}"),
            Self::Inconsistency(msg) => write!(f, "tree inconsistency: {msg}"),
            Self::InvalidMeta(msg) => write!(f, "invalid tree meta page: {msg}"),
            Self::LayoutMismatch { expected, found } => write!(
                f,
                "tree layout mismatch: expected 0x{expected:016x}, found 0x{found:016x}"
            ),
            Self::LayoutTooLarge {
                page_size,
                key_size,
                value_size,
            } => write!(
                f,
                "{key_size}-byte keys with {value_size}-byte values do not fit {page_size}-byte pages"
            ),
            Self::MultipleCloseFailures { first, suppressed } => write!(
                f,
                "{first} (and {} more close failures)",
                suppressed.len()
            ),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PageCache(e) => Some(e),
            Self::MultipleCloseFailures { first, .. } => Some(first.as_ref()),
            _ => None,
        }
    }
}

impl From<PageCacheError> for TreeError {
    fn from(e: PageCacheError) -> Self {
        Self::PageCache(e)
    }
}

const MAGIC: u64 = u64::from_le_bytes(*b"GBPTREE\0");
const FORMAT_VERSION: u32 = 1;

pub(crate) const META_PAGE: PageId = 0;
const STATE_PAGE_A: PageId = 1;
const STATE_PAGE_B: PageId = 2;
pub(crate) const FIRST_NODE_PAGE: PageId = 3;

/// Longer successor chains only come from a damaged file.
const MAX_SUCCESSOR_LINKS: usize = 1 << 16;

/// Generation of the root written by `initialize`.
const INITIAL_GENERATION: u64 = 1;

mod meta_offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const PAGE_SIZE: usize = 12;
    pub const LAYOUT: usize = 16;
    pub const KEY_SIZE: usize = 24;
    pub const VALUE_SIZE: usize = 28;
}

/// Writer-side bookkeeping, guarded by the writer mutex.
#[derive(Debug, Default)]
pub(crate) struct WriterState {
    pub stable: u64,
    pub unstable: u64,
    pub last_id: PageId,
    /// Carried through checkpoints untouched; pages are never freed.
    pub free_list: [u64; 2],
    pub free_list_pos: [u32; 2],
}

pub struct GbpTree<L: Layout> {
    layout: L,
    file: PagedFile,
    format: NodeFormat,
    root: RwLock<Pointer>,
    writer: Mutex<WriterState>,
    restart_limit: u32,
}

impl<L: Layout> GbpTree<L> {
    /// Open the tree stored in `file`, creating it when the file is empty.
    ///
    /// Opening always ends with a checkpoint marking the tree dirty, so a
    /// crash before `close()` is reported on the next open.
    ///
    /// # Errors
    ///
    /// - `TreeError::InvalidMeta` / `LayoutMismatch` for foreign files
    /// - `TreeError::Inconsistency` if neither state slot is usable
    pub fn open(file: PagedFile, layout: L, config: &EngineConfig) -> Result<Arc<Self>, TreeError> {
        let format = NodeFormat::new(&layout, file.page_size())?;
        let tree = Self {
            layout,
            file,
            format,
            root: RwLock::new(Pointer::NULL),
            writer: Mutex::new(WriterState::default()),
            restart_limit: config.tree_restart_limit,
        };

        if tree.file.page_count() == 0 {
            tree.initialize()?;
        } else {
            tree.load()?;
        }

        let mut writer = tree.writer.lock();
        tree.checkpoint_locked(&mut writer, false)?;
        drop(writer);
        Ok(Arc::new(tree))
    }

    fn initialize(&self) -> Result<(), TreeError> {
        let mut meta = vec![0u8; self.format.page_size()];
        write_u64(&mut meta, meta_offsets::MAGIC, MAGIC);
        write_u32(&mut meta, meta_offsets::FORMAT_VERSION, FORMAT_VERSION);
        #[allow(clippy::cast_possible_truncation)] // page sizes are far below 4 GiB
        {
            write_u32(&mut meta, meta_offsets::PAGE_SIZE, self.format.page_size() as u32);
            write_u32(&mut meta, meta_offsets::KEY_SIZE, self.layout.key_size() as u32);
            write_u32(&mut meta, meta_offsets::VALUE_SIZE, self.layout.value_size() as u32);
        }
        write_u64(&mut meta, meta_offsets::LAYOUT, self.layout.identifier());
        self.write_page(META_PAGE, &meta)?;

        let root = LeafNode {
            generation: INITIAL_GENERATION,
            left: Pointer::NULL,
            right: Pointer::NULL,
            successor: Pointer::NULL,
            keys: Vec::new(),
            values: Vec::new(),
        };
        self.write_page(FIRST_NODE_PAGE, &self.format.encode_leaf(&self.layout, &root))?;

        let state = TreeState {
            stable_generation: INITIAL_GENERATION,
            unstable_generation: INITIAL_GENERATION + 1,
            root_id: FIRST_NODE_PAGE,
            root_generation: INITIAL_GENERATION,
            last_id: FIRST_NODE_PAGE,
            clean: true,
            valid: true,
            ..TreeState::default()
        };
        let mut slot = vec![0u8; self.format.page_size()];
        state.write(&mut slot);
        self.write_page(STATE_PAGE_A, &slot)?;
        // Slot B stays zeroed, which fails its checksum.
        self.write_page(STATE_PAGE_B, &vec![0u8; self.format.page_size()])?;

        self.adopt(&state);
        info!(
            layout = self.layout.identifier(),
            page_size = self.format.page_size(),
            "created tree"
        );
        Ok(())
    }

    fn load(&self) -> Result<(), TreeError> {
        let mut cursor = self.file.read_cursor(META_PAGE);
        let mut buf = vec![0u8; self.format.page_size()];
        if !self.read_page(&mut cursor, META_PAGE, &mut buf)? {
            return Err(TreeError::InvalidMeta("meta page missing".to_string()));
        }
        self.check_meta(&buf)?;

        let (a, b) = self.read_states(&mut cursor)?;
        cursor.close();
        let (slot, state) = select_newest_valid_state(&a, &b)?;
        if !state.clean {
            let cleared = self.clear_crashed_successors(&state)?;
            warn!(
                generation = state.stable_generation,
                cleared,
                "tree was not closed cleanly, rolled back to the last checkpoint"
            );
        }
        self.adopt(&state);
        info!(
            ?slot,
            generation = state.stable_generation,
            root = state.root_id,
            "opened tree"
        );
        Ok(())
    }

    fn check_meta(&self, buf: &[u8]) -> Result<(), TreeError> {
        let magic = read_u64(buf, meta_offsets::MAGIC);
        if magic != MAGIC {
            return Err(TreeError::InvalidMeta(format!("bad magic 0x{magic:016x}")));
        }
        let version = read_u32(buf, meta_offsets::FORMAT_VERSION);
        if version != FORMAT_VERSION {
            return Err(TreeError::InvalidMeta(format!(
                "unsupported format version {version}"
            )));
        }
        let page_size = read_u32(buf, meta_offsets::PAGE_SIZE) as usize;
        if page_size != self.format.page_size() {
            return Err(TreeError::InvalidMeta(format!(
                "written with {page_size}-byte pages, opened with {}",
                self.format.page_size()
            )));
        }
        let found = read_u64(buf, meta_offsets::LAYOUT);
        if found != self.layout.identifier() {
            return Err(TreeError::LayoutMismatch {
                expected: self.layout.identifier(),
                found,
            });
        }
        let key_size = read_u32(buf, meta_offsets::KEY_SIZE) as usize;
        let value_size = read_u32(buf, meta_offsets::VALUE_SIZE) as usize;
        if key_size != self.layout.key_size() || value_size != self.layout.value_size() {
            return Err(TreeError::InvalidMeta(format!(
                "entry sizes {key_size}/{value_size} do not match layout"
            )));
        }
        Ok(())
    }

    /// Drop successor links written after the checkpoint `state` describes.
    /// Pages past `state.last_id` were allocated after it and are ignored.
    fn clear_crashed_successors(&self, state: &TreeState) -> Result<u64, TreeError> {
        let mut cursor = self.file.read_cursor(FIRST_NODE_PAGE);
        let mut buf = vec![0u8; self.format.page_size()];
        let mut cleared = 0;
        for page_id in FIRST_NODE_PAGE..=state.last_id {
            if !self.read_page(&mut cursor, page_id, &mut buf)? {
                break;
            }
            let generation = read_u64(&buf, offsets::SUCCESSOR_GENERATION);
            if generation > state.stable_generation {
                self.patch_pointer(page_id, offsets::SUCCESSOR_ID, Pointer::NULL)?;
                cleared += 1;
            }
        }
        cursor.close();
        Ok(cleared)
    }

    fn adopt(&self, state: &TreeState) {
        *self.root.write() = Pointer::new(state.root_id, state.root_generation);
        let mut writer = self.writer.lock();
        writer.stable = state.stable_generation;
        writer.unstable = state.unstable_generation;
        writer.last_id = state.last_id;
        writer.free_list = [state.free_list_write_page_id, state.free_list_read_page_id];
        writer.free_list_pos = [state.free_list_write_pos, state.free_list_read_pos];
    }

    fn read_states(&self, cursor: &mut ReadPageCursor) -> Result<(TreeState, TreeState), TreeError> {
        let mut buf = vec![0u8; self.format.page_size()];
        let a = if self.read_page(cursor, STATE_PAGE_A, &mut buf)? {
            TreeState::read(&buf)
        } else {
            TreeState::default()
        };
        let b = if self.read_page(cursor, STATE_PAGE_B, &mut buf)? {
            TreeState::read(&buf)
        } else {
            TreeState::default()
        };
        Ok((a, b))
    }

    /// Make everything written so far durable and advance the generations.
    ///
    /// Blocks while a `TreeWriter` is alive.
    ///
    /// # Errors
    ///
    /// Propagates page cache failures; the previous checkpoint stays valid.
    pub fn checkpoint(&self) -> Result<(), TreeError> {
        let mut writer = self.writer.lock();
        self.checkpoint_locked(&mut writer, false)
    }

    /// Checkpoint as clean and unmap the file.
    ///
    /// # Errors
    ///
    /// `PageCacheError::FileInUse` while seekers still hold pages.
    pub fn close(&self) -> Result<(), TreeError> {
        let mut writer = self.writer.lock();
        self.checkpoint_locked(&mut writer, true)?;
        self.file.close()?;
        Ok(())
    }

    fn checkpoint_locked(&self, writer: &mut WriterState, clean: bool) -> Result<(), TreeError> {
        self.file.flush()?;

        let mut cursor = self.file.read_cursor(STATE_PAGE_A);
        let (a, b) = self.read_states(&mut cursor)?;
        cursor.close();
        let (slot, _) = select_oldest_or_invalid(&a, &b)?;

        let root = *self.root.read();
        let next = TreeState {
            stable_generation: writer.unstable,
            unstable_generation: writer.unstable + 1,
            root_id: root.id,
            root_generation: root.generation,
            last_id: writer.last_id,
            free_list_write_page_id: writer.free_list[0],
            free_list_read_page_id: writer.free_list[1],
            free_list_write_pos: writer.free_list_pos[0],
            free_list_read_pos: writer.free_list_pos[1],
            clean,
            valid: true,
        };
        let mut buf = vec![0u8; self.format.page_size()];
        next.write(&mut buf);
        let page = match slot {
            Slot::A => STATE_PAGE_A,
            Slot::B => STATE_PAGE_B,
        };
        self.write_page(page, &buf)?;
        self.file.flush()?;

        writer.stable = next.stable_generation;
        writer.unstable = next.unstable_generation;
        info!(
            ?slot,
            generation = next.stable_generation,
            clean,
            "tree checkpoint"
        );
        Ok(())
    }

    /// Start a seek over `range`. Nothing is read until the first `next()`.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn seek(self: &Arc<Self>, range: SeekRange<L::Key>) -> TreeSeeker<L> {
        TreeSeeker::new(Arc::clone(self), range)
    }

    /// Take the single writer, blocking until any other writer is dropped.
    pub fn writer(&self) -> TreeWriter<'_, L> {
        TreeWriter::new(self, self.writer.lock())
    }

    #[must_use]
    pub const fn layout(&self) -> &L {
        &self.layout
    }

    /// Current root pointer.
    #[must_use]
    pub fn root(&self) -> Pointer {
        *self.root.read()
    }

    /// `(stable, unstable)` generations.
    #[must_use]
    pub fn generations(&self) -> (u64, u64) {
        let writer = self.writer.lock();
        (writer.stable, writer.unstable)
    }

    pub(crate) const fn file(&self) -> &PagedFile {
        &self.file
    }

    pub(crate) const fn format(&self) -> &NodeFormat {
        &self.format
    }

    pub(crate) const fn restart_limit(&self) -> u32 {
        self.restart_limit
    }

    pub(crate) fn publish_root(&self, root: Pointer) {
        *self.root.write() = root;
    }

    /// Copy a consistent image of `page_id` into `buf`.
    ///
    /// # Returns
    /// - `Ok(false)` if the page lies beyond the end of the file
    pub(crate) fn read_page(
        &self,
        cursor: &mut ReadPageCursor,
        page_id: PageId,
        buf: &mut [u8],
    ) -> Result<bool, TreeError> {
        if !cursor.next_to(page_id)? {
            return Ok(false);
        }
        loop {
            cursor.get_bytes(0, buf);
            if !cursor.should_retry() {
                break;
            }
        }
        if cursor.check_and_clear_bounds() {
            return Err(TreeError::Inconsistency(format!(
                "read of page {page_id} went out of bounds"
            )));
        }
        Ok(true)
    }

    pub(crate) fn read_node(
        &self,
        cursor: &mut ReadPageCursor,
        page_id: PageId,
        buf: &mut [u8],
    ) -> Result<Node<L::Key, L::Value>, TreeError> {
        if page_id < FIRST_NODE_PAGE || !self.read_page(cursor, page_id, buf)? {
            return Err(TreeError::Inconsistency(format!(
                "pointer to page {page_id} which is not a node"
            )));
        }
        self.format.decode(&self.layout, page_id, buf)
    }

    /// Read the newest version of the node `pointer` refers to, following
    /// successor links.
    ///
    /// # Returns
    /// - `Ok(None)` if a node along the way does not carry the generation its
    ///   pointer expects
    pub(crate) fn resolve(
        &self,
        cursor: &mut ReadPageCursor,
        pointer: Pointer,
        buf: &mut [u8],
    ) -> Result<Option<(PageId, Node<L::Key, L::Value>)>, TreeError> {
        let mut pointer = pointer;
        for _ in 0..MAX_SUCCESSOR_LINKS {
            let node = self.read_node(cursor, pointer.id, buf)?;
            if node.generation() != pointer.generation {
                return Ok(None);
            }
            let successor = node.successor();
            if successor.is_null() {
                return Ok(Some((pointer.id, node)));
            }
            pointer = successor;
        }
        Err(TreeError::Inconsistency(format!(
            "successor chain through page {} is longer than {MAX_SUCCESSOR_LINKS} links",
            pointer.id
        )))
    }

    /// Whether `target` is `pointer`'s page or one of its newer versions.
    pub(crate) fn reaches(
        &self,
        cursor: &mut ReadPageCursor,
        pointer: Pointer,
        target: PageId,
        buf: &mut [u8],
    ) -> Result<bool, TreeError> {
        let mut pointer = pointer;
        for _ in 0..MAX_SUCCESSOR_LINKS {
            if pointer.id == target {
                return Ok(true);
            }
            if pointer.is_null() {
                return Ok(false);
            }
            let node = self.read_node(cursor, pointer.id, buf)?;
            if node.generation() != pointer.generation {
                return Ok(false);
            }
            pointer = node.successor();
        }
        Ok(false)
    }

    /// Overwrite a whole page. The write cursor is released before returning.
    pub(crate) fn write_page(&self, page_id: PageId, bytes: &[u8]) -> Result<(), TreeError> {
        let mut cursor = self.file.write_cursor(page_id);
        cursor.next()?;
        cursor.put_bytes(0, bytes);
        cursor.close();
        Ok(())
    }

    /// Rewrite the `(id, generation)` pair stored at `offset` of a page.
    ///
    /// Both words change under one page lock, so no reader sees a new id
    /// paired with an old generation.
    pub(crate) fn patch_pointer(
        &self,
        page_id: PageId,
        offset: usize,
        pointer: Pointer,
    ) -> Result<(), TreeError> {
        let mut cursor = self.file.write_cursor(page_id);
        cursor.next()?;
        cursor.put_u64(offset, pointer.id);
        cursor.put_u64(offset + 8, pointer.generation);
        cursor.close();
        Ok(())
    }
}

impl<L: Layout> std::fmt::Debug for GbpTree<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GbpTree")
            .field("layout", &self.layout.identifier())
            .field("root", &self.root())
            .field("file", &self.file)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Bound;

    use super::*;
    use crate::index::layout::U64Layout;
    use crate::index::seeker::Seeker;
    use crate::pagecache::{PageCache, Storage};
    use crate::testing::SimulatedStorage;

    const PAGE_SIZE: usize = 256;

    fn config() -> EngineConfig {
        EngineConfig {
            page_size: PAGE_SIZE,
            ..EngineConfig::default()
        }
    }

    fn open_on(storage: &Arc<SimulatedStorage>) -> Arc<GbpTree<U64Layout>> {
        let file = PageCache::with_capacity(64, PAGE_SIZE)
            .map_storage(Arc::clone(storage) as Arc<dyn Storage>)
            .unwrap();
        GbpTree::open(file, U64Layout, &config()).unwrap()
    }

    fn collect(tree: &Arc<GbpTree<U64Layout>>) -> Vec<(u64, u64)> {
        let mut seeker = tree.seek(SeekRange::all());
        let mut out = Vec::new();
        while seeker.next().unwrap() {
            out.push((*seeker.key().unwrap(), *seeker.value().unwrap()));
        }
        seeker.close().unwrap();
        out
    }

    #[test]
    fn test_new_tree_is_empty() {
        let storage = Arc::new(SimulatedStorage::new(1, PAGE_SIZE));
        let tree = open_on(&storage);
        assert!(collect(&tree).is_empty());
        assert_eq!(tree.root().id, FIRST_NODE_PAGE);
        // create wrote generation 1 stable, the opening checkpoint moved on.
        assert_eq!(tree.generations(), (2, 3));
        tree.close().unwrap();
    }

    #[test]
    fn test_contents_survive_close_and_reopen() {
        let storage = Arc::new(SimulatedStorage::new(2, PAGE_SIZE));
        let tree = open_on(&storage);
        {
            let mut writer = tree.writer();
            for key in (0..500u64).rev() {
                writer.put(key, key * 10).unwrap();
            }
        }
        tree.close().unwrap();

        let reopened = open_on(&storage);
        let entries = collect(&reopened);
        assert_eq!(entries.len(), 500);
        assert!(entries.iter().enumerate().all(|(i, &(k, v))| k == i as u64 && v == k * 10));
        reopened.close().unwrap();
    }

    #[test]
    fn test_checkpoint_alternates_slots_and_advances_generations() {
        let storage = Arc::new(SimulatedStorage::new(3, PAGE_SIZE));
        let tree = open_on(&storage);
        let (stable, unstable) = tree.generations();
        tree.checkpoint().unwrap();
        assert_eq!(tree.generations(), (unstable, unstable + 1));
        tree.checkpoint().unwrap();
        assert_eq!(tree.generations(), (unstable + 1, unstable + 2));
        assert!(stable < unstable);
        tree.close().unwrap();
    }

    #[test]
    fn test_reopen_falls_back_to_older_slot_when_newest_is_corrupt() {
        let storage = Arc::new(SimulatedStorage::new(4, PAGE_SIZE));
        let tree = open_on(&storage);
        tree.writer().put(7, 70).unwrap();
        tree.close().unwrap();

        // The clean close went into one slot; corrupt whichever is newest.
        let mut a = vec![0u8; PAGE_SIZE];
        let mut b = vec![0u8; PAGE_SIZE];
        storage.read_page(STATE_PAGE_A, &mut a).unwrap();
        storage.read_page(STATE_PAGE_B, &mut b).unwrap();
        let newest = if TreeState::read(&a).unstable_generation > TreeState::read(&b).unstable_generation {
            STATE_PAGE_A
        } else {
            STATE_PAGE_B
        };
        storage.flip_bit(newest, 3, 1);

        let reopened = open_on(&storage);
        assert_eq!(collect(&reopened), vec![(7, 70)]);
        reopened.close().unwrap();
    }

    #[test]
    fn test_crash_between_checkpoints_reopens_last_checkpoint() {
        let storage = Arc::new(SimulatedStorage::new(8, PAGE_SIZE));
        let tree = open_on(&storage);
        {
            let mut writer = tree.writer();
            for key in 0..40u64 {
                writer.put(key, key).unwrap();
            }
        }
        tree.checkpoint().unwrap();
        {
            let mut writer = tree.writer();
            for key in 40..100u64 {
                writer.put(key, key).unwrap();
            }
            for key in (0..40u64).step_by(2) {
                writer.remove(&key).unwrap();
            }
            writer.put(1, 1_000).unwrap();
        }
        // Every page reaches storage, then the process dies without a checkpoint.
        tree.file().flush().unwrap();
        drop(tree);

        let reopened = open_on(&storage);
        let expected: Vec<(u64, u64)> = (0..40).map(|k| (k, k)).collect();
        assert_eq!(collect(&reopened), expected);
        {
            let mut writer = reopened.writer();
            for key in 40..100u64 {
                writer.put(key, key * 2).unwrap();
            }
        }
        let entries = collect(&reopened);
        assert_eq!(entries.len(), 100);
        assert_eq!(entries[99], (99, 198));
        reopened.close().unwrap();

        let again = open_on(&storage);
        assert_eq!(collect(&again).len(), 100);
        again.close().unwrap();
    }

    #[test]
    fn test_crash_before_first_checkpointed_write_reopens_empty() {
        let storage = Arc::new(SimulatedStorage::new(9, PAGE_SIZE));
        let tree = open_on(&storage);
        {
            let mut writer = tree.writer();
            for key in 0..60u64 {
                writer.put(key, key).unwrap();
            }
        }
        tree.file().flush().unwrap();
        drop(tree);

        let reopened = open_on(&storage);
        assert!(collect(&reopened).is_empty());
        assert_eq!(reopened.writer().put(7, 70).unwrap(), None);
        assert_eq!(collect(&reopened), vec![(7, 70)]);
        reopened.close().unwrap();
    }

    #[test]
    fn test_checkpointed_pages_are_not_rewritten() {
        let storage = Arc::new(SimulatedStorage::new(10, PAGE_SIZE));
        let tree = open_on(&storage);
        tree.writer().put(1, 10).unwrap();
        tree.checkpoint().unwrap();
        let checkpointed = tree.root();

        tree.writer().put(1, 11).unwrap();
        let root = tree.root();
        assert_ne!(root.id, checkpointed.id);
        assert!(root.generation > checkpointed.generation);

        // The old page only gained a successor link to its copy.
        let mut cursor = tree.file().read_cursor(0);
        let mut buf = vec![0u8; PAGE_SIZE];
        let Some((newest, node)) = tree.resolve(&mut cursor, checkpointed, &mut buf).unwrap() else {
            panic!("checkpointed root no longer matches its pointer");
        };
        assert_eq!(newest, root.id);
        assert_eq!(node.generation(), root.generation);
        let Node::Leaf(old) = tree.read_node(&mut cursor, checkpointed.id, &mut buf).unwrap() else {
            panic!("expected leaf");
        };
        assert_eq!(old.values, vec![10]);
        assert_eq!(old.successor, root);
        cursor.close();
        tree.close().unwrap();
    }

    #[test]
    fn test_both_slots_corrupt_fails_open() {
        let storage = Arc::new(SimulatedStorage::new(5, PAGE_SIZE));
        open_on(&storage).close().unwrap();
        storage.flip_bit(STATE_PAGE_A, 0, 0);
        storage.flip_bit(STATE_PAGE_B, 0, 0);

        let file = PageCache::with_capacity(16, PAGE_SIZE)
            .map_storage(Arc::clone(&storage) as Arc<dyn Storage>)
            .unwrap();
        assert!(matches!(
            GbpTree::open(file, U64Layout, &config()),
            Err(TreeError::Inconsistency(_))
        ));
    }

    #[test]
    fn test_foreign_layout_is_rejected() {
        struct OtherLayout;
        impl Layout for OtherLayout {
            type Key = u64;
            type Value = u64;
            fn identifier(&self) -> u64 {
                42
            }
            fn key_size(&self) -> usize {
                8
            }
            fn value_size(&self) -> usize {
                8
            }
            fn write_key(&self, key: &u64, buf: &mut [u8]) {
                write_u64(buf, 0, *key);
            }
            fn read_key(&self, buf: &[u8]) -> u64 {
                read_u64(buf, 0)
            }
            fn write_value(&self, value: &u64, buf: &mut [u8]) {
                write_u64(buf, 0, *value);
            }
            fn read_value(&self, buf: &[u8]) -> u64 {
                read_u64(buf, 0)
            }
            fn compare(&self, left: &u64, right: &u64) -> std::cmp::Ordering {
                left.cmp(right)
            }
        }

        let storage = Arc::new(SimulatedStorage::new(6, PAGE_SIZE));
        open_on(&storage).close().unwrap();
        let file = PageCache::with_capacity(16, PAGE_SIZE)
            .map_storage(Arc::clone(&storage) as Arc<dyn Storage>)
            .unwrap();
        assert!(matches!(
            GbpTree::open(file, OtherLayout, &config()),
            Err(TreeError::LayoutMismatch { expected: 42, .. })
        ));
    }

    #[test]
    fn test_close_with_open_seeker_fails() {
        let storage = Arc::new(SimulatedStorage::new(7, PAGE_SIZE));
        let tree = open_on(&storage);
        tree.writer().put(1, 1).unwrap();
        let mut seeker = tree.seek(SeekRange::new(Bound::Included(1), Bound::Unbounded));
        assert!(seeker.next().unwrap());
        assert!(matches!(
            tree.close(),
            Err(TreeError::PageCache(PageCacheError::FileInUse { .. }))
        ));
        seeker.close().unwrap();
        tree.close().unwrap();
    }
}
