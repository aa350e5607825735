//! Kernel read and write paths over the indexes.
//!
//! Read side: entity cursors merge committed index hits with the changes of
//! the running transaction. Write side: committed command batches are turned
//! into index updates.

mod command;
mod index_updates;
mod token_cursor;
mod tx_state;
mod value_cursor;

pub use command::StorageCommand;
pub use index_updates::{IndexUpdateSummary, IndexUpdater};
pub use token_cursor::EntityTokenIndexCursor;
pub use tx_state::{AddedAndRemoved, TransactionState, ValueChanges};
pub use value_cursor::{EntityValueIndexCursor, PropertyReader};

use crate::index::TreeError;
use crate::txlog::LogError;

/// Errors raised by kernel cursors.
#[derive(Debug)]
pub enum CursorError {
    /// Index access failed.
    Tree(TreeError),
    /// Reading the transaction log failed.
    Log(LogError),
    /// The cursor was closed and cannot be reused.
    Closed,
}

impl std::fmt::Display for CursorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree(e) => write!(f, "index error: {e}"),
            Self::Log(e) => write!(f, "log error: {e}"),
            Self::Closed => write!(f, "cursor is closed"),
        }
    }
}

impl std::error::Error for CursorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(e) => Some(e),
            Self::Log(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<TreeError> for CursorError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<LogError> for CursorError {
    fn from(e: LogError) -> Self {
        Self::Log(e)
    }
}
