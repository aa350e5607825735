// Life of a write:
// 1. Commands are collected in the transaction state
// 2. The batch is appended to the transaction log
// 3. Once committed, the commands are applied to the indexes
//    under the tree's unstable generation
// 4. A checkpoint flips the tree state pair
//
// Life of a read:
// 1. A kernel cursor seeks an index progressor
// 2. Hits are merged with the transaction state
// 3. Pages are read through optimistic page cursors
//
// System components:
//  - Page cache with pre-fetching
//  - Generation-stamped B+tree indexes
//  - Transaction log with forward and reversed cursors

pub mod concurrency;
pub mod config;
pub mod index;
pub mod kernel;
pub mod pagecache;
pub mod txlog;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, EngineConfig};
