//! Turning committed commands into index updates.
//!
//! Live commits and recovery go through the same path: a batch is applied
//! only once its transaction has committed. Chunks of a transaction are held
//! back until its final chunk commits and dropped if it rolls back.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::index::{TokenChange, TokenIndex, TreeError, ValueChange, ValueIndex};
use crate::kernel::{CursorError, StorageCommand};
use crate::txlog::{CommandBatchCursor, LoggedBatch, Terminator};

/// What an update pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexUpdateSummary {
    /// Committed transactions applied.
    pub transactions: u64,
    pub token_changes: u64,
    pub value_changes: u64,
    /// Value changes for indexes this updater does not know.
    pub skipped: u64,
}

impl IndexUpdateSummary {
    const fn absorb(&mut self, other: Self) {
        self.transactions += other.transactions;
        self.token_changes += other.token_changes;
        self.value_changes += other.value_changes;
        self.skipped += other.skipped;
    }
}

pub struct IndexUpdater {
    tokens: TokenIndex,
    values: HashMap<u32, ValueIndex>,
    /// Commands of chunked transactions still waiting for their commit.
    pending: HashMap<u64, Vec<StorageCommand>>,
}

impl IndexUpdater {
    #[must_use]
    pub fn new(tokens: TokenIndex) -> Self {
        Self {
            tokens,
            values: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Maintain value index `id` from now on.
    #[must_use]
    pub fn with_value_index(mut self, id: u32, index: ValueIndex) -> Self {
        self.values.insert(id, index);
        self
    }

    #[must_use]
    pub const fn tokens(&self) -> &TokenIndex {
        &self.tokens
    }

    #[must_use]
    pub fn value_index(&self, id: u32) -> Option<&ValueIndex> {
        self.values.get(&id)
    }

    /// Apply the commands of one committed transaction.
    pub fn apply(&self, commands: &[StorageCommand]) -> Result<IndexUpdateSummary, TreeError> {
        let mut summary = IndexUpdateSummary {
            transactions: 1,
            ..IndexUpdateSummary::default()
        };
        let mut token_changes: Vec<TokenChange> = Vec::new();
        let mut value_changes: HashMap<u32, Vec<ValueChange>> = HashMap::new();
        for command in commands {
            if let Some(change) = command.token_change() {
                token_changes.push(change);
            }
            if let Some((index, change)) = command.value_change() {
                value_changes.entry(index).or_default().push(change);
            }
        }

        summary.token_changes = token_changes.len() as u64;
        self.tokens.apply(token_changes)?;
        for (id, changes) in value_changes {
            let count = changes.len() as u64;
            if let Some(index) = self.values.get(&id) {
                index.apply(changes)?;
                summary.value_changes += count;
            } else {
                warn!(index = id, count, "dropping changes for unknown value index");
                summary.skipped += count;
            }
        }
        Ok(summary)
    }

    /// Feed one logged batch, applying it once its transaction commits.
    pub fn accept(&mut self, logged: &LoggedBatch) -> Result<IndexUpdateSummary, TreeError> {
        let batch = &logged.batch;
        match batch.terminator {
            Terminator::ChunkEnd => {
                self.pending
                    .entry(batch.tx_id)
                    .or_default()
                    .extend_from_slice(&batch.commands);
                Ok(IndexUpdateSummary::default())
            }
            Terminator::Rollback => {
                self.pending.remove(&batch.tx_id);
                debug!(tx_id = batch.tx_id, "skipping rolled back transaction");
                Ok(IndexUpdateSummary::default())
            }
            Terminator::Commit => match self.pending.remove(&batch.tx_id) {
                Some(mut commands) => {
                    commands.extend_from_slice(&batch.commands);
                    self.apply(&commands)
                }
                None => self.apply(&batch.commands),
            },
        }
    }

    /// Apply every committed transaction `cursor` yields, in cursor order.
    pub fn replay(&mut self, cursor: &mut dyn CommandBatchCursor) -> Result<IndexUpdateSummary, CursorError> {
        let mut summary = IndexUpdateSummary::default();
        while cursor.next()? {
            if let Some(logged) = cursor.get() {
                summary.absorb(self.accept(logged)?);
            }
        }
        if !self.pending.is_empty() {
            debug!(open = self.pending.len(), "replay ended inside chunked transactions");
        }
        Ok(summary)
    }

    /// Checkpoint every index.
    pub fn checkpoint(&self) -> Result<(), TreeError> {
        self.tokens.checkpoint()?;
        for index in self.values.values() {
            index.checkpoint()?;
        }
        Ok(())
    }
}
