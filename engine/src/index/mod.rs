//! Indexes backed by generation-stamped B+trees.
//!
//! - `tree` / `writer` / `seeker`: the tree, its single writer, range seekers
//! - `tree_state`: the checksummed state pair consulted on open
//! - `combined`: merge of partitioned seekers
//! - `token`: token scan index (entity ids grouped in 64-bit bitsets)
//! - `value`: value index over `(value, entity)` keys

mod combined;
mod layout;
mod node;
mod seeker;
mod token;
mod tree;
mod tree_state;
mod value;
mod writer;

pub use combined::CombinedSeeker;
pub use layout::Layout;
pub use node::{NO_NODE, Pointer};
pub use seeker::{SeekRange, Seeker, TreeSeeker};
pub use token::{
    RANGE_SIZE, TokenChange, TokenIndex, TokenScanKey, TokenScanLayout,
    TokenScanValueIndexProgressor, range_of,
};
pub use tree::{GbpTree, TreeError};
pub use tree_state::{
    Slot, TREE_STATE_SIZE, TreeState, select_newest_valid_state, select_oldest_or_invalid,
};
pub use value::{ValueChange, ValueIndex, ValueIndexProgressor, ValueKey, ValueLayout, ValueQuery};
pub use writer::TreeWriter;

/// Entity id reported by a progressor that is not positioned.
pub const NO_ENTITY: u64 = u64::MAX;

/// Order in which index results are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexOrder {
    /// Any order; index-native (ascending) in practice.
    #[default]
    Unordered,
    Ascending,
    Descending,
}

/// Pull-based cursor over index hits.
pub trait IndexProgressor {
    /// Move to the next hit.
    fn next(&mut self) -> Result<bool, TreeError>;

    /// Entity of the current hit, `NO_ENTITY` when not positioned.
    fn entity(&self) -> u64;

    /// Release the underlying seeker. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), TreeError>;
}
