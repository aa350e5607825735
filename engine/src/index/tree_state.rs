//! Tree state pair: two checksummed header slots.
//!
//! Every checkpoint writes a complete `TreeState` into one of two slots (pages
//! 1 and 2 of a tree file), alternating. A crash mid-write corrupts at most the
//! slot being written, so the other still describes the last checkpoint.
//!
//! # Slot Layout
//!
//! ```text
//! +------+-----------------------------+------+
//! | off  | field                       | size |
//! +------+-----------------------------+------+
//! |    0 | stable_generation           |    8 |
//! |    8 | unstable_generation         |    8 |
//! |   16 | root_id                     |    8 |
//! |   24 | root_generation             |    8 |
//! |   32 | last_id                     |    8 |
//! |   40 | free_list_write_page_id     |    8 |
//! |   48 | free_list_read_page_id      |    8 |
//! |   56 | free_list_write_pos         |    4 |
//! |   60 | free_list_read_pos          |    4 |
//! |   64 | clean                       |    1 |
//! |   65 | zero padding                |    3 |
//! |   68 | CRC32 of bytes 0..68        |    4 |
//! +------+-----------------------------+------+
//! ```
//!
//! # Invariants
//!
//! - Selection is a pure function of the two decoded slots
//! - A single flipped bit anywhere in 0..72 fails the checksum

use crate::index::layout::{read_u32, read_u64, write_u32, write_u64};
use crate::index::TreeError;

/// Number of bytes a slot occupies.
pub const TREE_STATE_SIZE: usize = 72;

mod offsets {
    pub const STABLE_GENERATION: usize = 0;
    pub const UNSTABLE_GENERATION: usize = 8;
    pub const ROOT_ID: usize = 16;
    pub const ROOT_GENERATION: usize = 24;
    pub const LAST_ID: usize = 32;
    pub const FREE_LIST_WRITE_PAGE_ID: usize = 40;
    pub const FREE_LIST_READ_PAGE_ID: usize = 48;
    pub const FREE_LIST_WRITE_POS: usize = 56;
    pub const FREE_LIST_READ_POS: usize = 60;
    pub const CLEAN: usize = 64;
    pub const CHECKSUM: usize = 68;
}

/// One decoded slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeState {
    pub stable_generation: u64,
    pub unstable_generation: u64,
    pub root_id: u64,
    pub root_generation: u64,
    pub last_id: u64,
    pub free_list_write_page_id: u64,
    pub free_list_read_page_id: u64,
    pub free_list_write_pos: u32,
    pub free_list_read_pos: u32,
    pub clean: bool,
    /// Whether the slot's checksum matched when it was read.
    pub valid: bool,
}

impl TreeState {
    /// Decode a slot. Never fails: a bad checksum yields `valid == false`.
    ///
    /// # Pre-conditions
    /// - `buf.len() >= TREE_STATE_SIZE`
    #[must_use]
    pub fn read(buf: &[u8]) -> Self {
        let stored = read_u32(buf, offsets::CHECKSUM);
        Self {
            stable_generation: read_u64(buf, offsets::STABLE_GENERATION),
            unstable_generation: read_u64(buf, offsets::UNSTABLE_GENERATION),
            root_id: read_u64(buf, offsets::ROOT_ID),
            root_generation: read_u64(buf, offsets::ROOT_GENERATION),
            last_id: read_u64(buf, offsets::LAST_ID),
            free_list_write_page_id: read_u64(buf, offsets::FREE_LIST_WRITE_PAGE_ID),
            free_list_read_page_id: read_u64(buf, offsets::FREE_LIST_READ_PAGE_ID),
            free_list_write_pos: read_u32(buf, offsets::FREE_LIST_WRITE_POS),
            free_list_read_pos: read_u32(buf, offsets::FREE_LIST_READ_POS),
            clean: buf[offsets::CLEAN] != 0,
            valid: crc32fast::hash(&buf[..offsets::CHECKSUM]) == stored,
        }
    }

    /// Encode into a slot, computing a fresh checksum.
    ///
    /// # Pre-conditions
    /// - `buf.len() >= TREE_STATE_SIZE`
    pub fn write(&self, buf: &mut [u8]) {
        write_u64(buf, offsets::STABLE_GENERATION, self.stable_generation);
        write_u64(buf, offsets::UNSTABLE_GENERATION, self.unstable_generation);
        write_u64(buf, offsets::ROOT_ID, self.root_id);
        write_u64(buf, offsets::ROOT_GENERATION, self.root_generation);
        write_u64(buf, offsets::LAST_ID, self.last_id);
        write_u64(buf, offsets::FREE_LIST_WRITE_PAGE_ID, self.free_list_write_page_id);
        write_u64(buf, offsets::FREE_LIST_READ_PAGE_ID, self.free_list_read_page_id);
        write_u32(buf, offsets::FREE_LIST_WRITE_POS, self.free_list_write_pos);
        write_u32(buf, offsets::FREE_LIST_READ_POS, self.free_list_read_pos);
        buf[offsets::CLEAN] = u8::from(self.clean);
        buf[offsets::CLEAN + 1..offsets::CHECKSUM].fill(0);
        let checksum = crc32fast::hash(&buf[..offsets::CHECKSUM]);
        write_u32(buf, offsets::CHECKSUM, checksum);
    }
}

/// Which of the two slots a selection picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

/// Pick the state a tree opens from.
///
/// Prefers the higher `unstable_generation` when its checksum holds, else the
/// other slot when its checksum holds.
///
/// # Errors
///
/// `TreeError::Inconsistency` if both slots are corrupt, or if both are valid
/// with equal generations (no newest exists).
pub fn select_newest_valid_state(
    a: &TreeState,
    b: &TreeState,
) -> Result<(Slot, TreeState), TreeError> {
    match (a.valid, b.valid) {
        (true, true) => match a.unstable_generation.cmp(&b.unstable_generation) {
            std::cmp::Ordering::Greater => Ok((Slot::A, *a)),
            std::cmp::Ordering::Less => Ok((Slot::B, *b)),
            std::cmp::Ordering::Equal => Err(TreeError::Inconsistency(format!(
                "both tree state slots carry unstable generation {}",
                a.unstable_generation
            ))),
        },
        (true, false) => Ok((Slot::A, *a)),
        (false, true) => Ok((Slot::B, *b)),
        (false, false) => Err(TreeError::Inconsistency(
            "both tree state slots fail their checksum".to_string(),
        )),
    }
}

/// Pick the slot the next checkpoint overwrites.
///
/// A corrupt slot is returned when exactly one is corrupt; otherwise the slot
/// with the lower `unstable_generation`, whatever its `clean` flag.
///
/// # Errors
///
/// `TreeError::Inconsistency` if both slots are corrupt.
pub fn select_oldest_or_invalid(
    a: &TreeState,
    b: &TreeState,
) -> Result<(Slot, TreeState), TreeError> {
    match (a.valid, b.valid) {
        (false, false) => Err(TreeError::Inconsistency(
            "both tree state slots fail their checksum".to_string(),
        )),
        (false, true) => Ok((Slot::A, *a)),
        (true, false) => Ok((Slot::B, *b)),
        (true, true) => {
            if a.unstable_generation < b.unstable_generation {
                Ok((Slot::A, *a))
            } else {
                Ok((Slot::B, *b))
            }
        }
    }
}
