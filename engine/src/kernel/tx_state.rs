//! Changes made by the running transaction, not yet in any index.
//!
//! Cursors never read these structures live: they take a frozen copy when
//! they initialize, so later changes in the same transaction cannot make an
//! entity appear twice or vanish mid-iteration.

use std::collections::{BTreeMap, BTreeSet};

use crate::index::{ValueChange, ValueKey, ValueQuery};
use crate::kernel::StorageCommand;

/// Entity ids a transaction added to and removed from one token.
///
/// # Invariants
///
/// - `added` and `removed` are disjoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddedAndRemoved {
    added: BTreeSet<u64>,
    removed: BTreeSet<u64>,
}

impl AddedAndRemoved {
    /// Removing an id this transaction added only undoes the add.
    pub fn add(&mut self, id: u64) {
        if !self.removed.remove(&id) {
            self.added.insert(id);
        }
    }

    pub fn remove(&mut self, id: u64) {
        if !self.added.remove(&id) {
            self.removed.insert(id);
        }
    }

    #[must_use]
    pub const fn added(&self) -> &BTreeSet<u64> {
        &self.added
    }

    #[must_use]
    pub const fn removed(&self) -> &BTreeSet<u64> {
        &self.removed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A transaction's changes to one value index.
///
/// `removed` holds entities whose committed index entry no longer holds;
/// `added` holds the entries the transaction would write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueChanges {
    added: BTreeSet<ValueKey>,
    removed: BTreeSet<u64>,
}

impl ValueChanges {
    pub fn record(&mut self, change: ValueChange) {
        if let Some(before) = change.before {
            let was_added = self.added.remove(&ValueKey::new(before, change.entity));
            if !was_added {
                self.removed.insert(change.entity);
            }
        }
        if let Some(after) = change.after {
            self.added.insert(ValueKey::new(after, change.entity));
        }
    }

    /// Entities added with exactly `value`, ascending.
    #[must_use]
    pub fn added_with_value(&self, value: i64) -> Vec<u64> {
        self.added
            .range(ValueKey::new(value, 0)..=ValueKey::new(value, u64::MAX))
            .map(|key| key.entity)
            .collect()
    }

    /// Added entries matching `query`, ordered by `(value, entity)`.
    #[must_use]
    pub fn added_matching(&self, query: &ValueQuery) -> Vec<ValueKey> {
        self.added
            .iter()
            .filter(|key| query.matches(key.value))
            .copied()
            .collect()
    }

    #[must_use]
    pub const fn removed(&self) -> &BTreeSet<u64> {
        &self.removed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// All index-relevant changes of one transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionState {
    tokens: BTreeMap<u32, AddedAndRemoved>,
    values: BTreeMap<u32, ValueChanges>,
    commands: Vec<StorageCommand>,
}

impl TransactionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a command, keeping it for the commit batch.
    pub fn record(&mut self, command: StorageCommand) {
        if let Some(change) = command.token_change() {
            let entry = self.tokens.entry(change.token).or_default();
            if change.added {
                entry.add(change.entity);
            } else {
                entry.remove(change.entity);
            }
        }
        if let Some((index, change)) = command.value_change() {
            self.values.entry(index).or_default().record(change);
        }
        self.commands.push(command);
    }

    /// Frozen copy of the changes to `token`.
    #[must_use]
    pub fn token_changes(&self, token: u32) -> AddedAndRemoved {
        self.tokens.get(&token).cloned().unwrap_or_default()
    }

    /// Frozen copy of the changes to value index `index`.
    #[must_use]
    pub fn value_changes(&self, index: u32) -> ValueChanges {
        self.values.get(&index).cloned().unwrap_or_default()
    }

    /// Commands in the order they were recorded.
    #[must_use]
    pub fn commands(&self) -> &[StorageCommand] {
        &self.commands
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
