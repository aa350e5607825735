//! Token index cursor that overlays the running transaction's changes.
//!
//! Serves label and relationship type scans alike: both are token indexes.

use std::collections::BTreeSet;

use crate::index::{
    IndexOrder, IndexProgressor, NO_ENTITY, TokenIndex, TokenScanValueIndexProgressor,
};
use crate::kernel::{AddedAndRemoved, CursorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    TxState,
    IndexOnly,
    Ordered,
    Exhausted,
    Closed,
}

/// # Invariants
///
/// - `added` is sorted in output order, ascending when unordered
/// - `peek` never holds an id in `removed` or `added_ids`
pub struct EntityTokenIndexCursor {
    state: State,
    order: IndexOrder,
    progressor: Option<TokenScanValueIndexProgressor>,
    added: Vec<u64>,
    added_pos: usize,
    added_ids: BTreeSet<u64>,
    removed: BTreeSet<u64>,
    peek: Option<u64>,
    index_done: bool,
    current: u64,
}

impl Default for EntityTokenIndexCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityTokenIndexCursor {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: State::Uninitialized,
            order: IndexOrder::Unordered,
            progressor: None,
            added: Vec::new(),
            added_pos: 0,
            added_ids: BTreeSet::new(),
            removed: BTreeSet::new(),
            peek: None,
            index_done: false,
            current: NO_ENTITY,
        }
    }

    /// Start scanning `token`, snapshotting `tx` if given.
    pub fn initialize(
        &mut self,
        index: &TokenIndex,
        token: u32,
        order: IndexOrder,
        tx: Option<&AddedAndRemoved>,
    ) -> Result<(), CursorError> {
        if self.state == State::Closed {
            return Err(CursorError::Closed);
        }
        if let Some(mut previous) = self.progressor.take() {
            previous.close()?;
        }
        self.added_ids = tx.map(|changes| changes.added().clone()).unwrap_or_default();
        self.removed = tx.map(|changes| changes.removed().clone()).unwrap_or_default();
        self.added = self.added_ids.iter().copied().collect();
        if order == IndexOrder::Descending {
            self.added.reverse();
        }
        self.added_pos = 0;
        self.peek = None;
        self.index_done = false;
        self.current = NO_ENTITY;
        self.progressor = Some(index.scan(token, order));
        self.order = order;
        self.state = if order == IndexOrder::Unordered {
            State::TxState
        } else {
            State::Ordered
        };
        Ok(())
    }

    const fn descending(&self) -> bool {
        matches!(self.order, IndexOrder::Descending)
    }

    /// Whether `id` comes before `target` in scan order.
    const fn before(&self, id: u64, target: u64) -> bool {
        if self.descending() { id > target } else { id < target }
    }

    pub fn next(&mut self) -> Result<bool, CursorError> {
        loop {
            match self.state {
                State::TxState => {
                    if let Some(&id) = self.added.get(self.added_pos) {
                        self.added_pos += 1;
                        self.current = id;
                        return Ok(true);
                    }
                    self.state = State::IndexOnly;
                }
                State::IndexOnly => {
                    let next = match self.peek.take() {
                        Some(id) => Some(id),
                        None => self.next_accepted()?,
                    };
                    return Ok(self.position_at(next));
                }
                State::Ordered => {
                    if self.peek.is_none() && !self.index_done {
                        self.peek = self.next_accepted()?;
                        self.index_done = self.peek.is_none();
                    }
                    let tx = self.added.get(self.added_pos).copied();
                    let next = match (tx, self.peek) {
                        (Some(tx), Some(hit)) if !self.before(tx, hit) => self.peek.take(),
                        (Some(tx), _) => {
                            self.added_pos += 1;
                            Some(tx)
                        }
                        (None, _) => self.peek.take(),
                    };
                    return Ok(self.position_at(next));
                }
                State::Uninitialized | State::Exhausted | State::Closed => return Ok(false),
            }
        }
    }

    fn position_at(&mut self, next: Option<u64>) -> bool {
        if let Some(id) = next {
            self.current = id;
            true
        } else {
            self.state = State::Exhausted;
            self.current = NO_ENTITY;
            false
        }
    }

    fn next_accepted(&mut self) -> Result<Option<u64>, CursorError> {
        let Some(progressor) = self.progressor.as_mut() else {
            return Ok(None);
        };
        while progressor.next()? {
            let id = progressor.entity();
            if !self.removed.contains(&id) && !self.added_ids.contains(&id) {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Position so the next `next()` yields the first id at or after `id` in
    /// scan order. Unordered cursors skip as if ascending.
    pub fn skip_until(&mut self, id: u64) -> Result<(), CursorError> {
        if matches!(self.state, State::Closed | State::Exhausted | State::Uninitialized) {
            return Ok(());
        }
        while self
            .added
            .get(self.added_pos)
            .is_some_and(|&added| self.before(added, id))
        {
            self.added_pos += 1;
        }
        if self.peek.is_some_and(|peek| self.before(peek, id)) {
            self.peek = None;
        }
        if self.peek.is_some() {
            return Ok(());
        }
        if let Some(progressor) = self.progressor.as_mut() {
            progressor.skip_until(id)?;
        }
        Ok(())
    }

    /// Current entity, `NO_ENTITY` when not positioned.
    #[must_use]
    pub const fn entity(&self) -> u64 {
        self.current
    }

    /// Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), CursorError> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.state = State::Closed;
        self.current = NO_ENTITY;
        if let Some(mut progressor) = self.progressor.take() {
            progressor.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::index::TokenChange;
    use crate::pagecache::{PageCache, Storage};
    use crate::testing::SimulatedStorage;

    const TOKEN: u32 = 3;

    fn index_with(entities: &[u64]) -> TokenIndex {
        let storage: Arc<dyn Storage> = Arc::new(SimulatedStorage::new(5, 512));
        let file = PageCache::with_capacity(64, 512).map_storage(storage).unwrap();
        let index = TokenIndex::open(file, &EngineConfig::default()).unwrap();
        index
            .apply(entities.iter().map(|&entity| TokenChange {
                entity,
                token: TOKEN,
                added: true,
            }))
            .unwrap();
        index
    }

    fn tx(added: &[u64], removed: &[u64]) -> AddedAndRemoved {
        let mut changes = AddedAndRemoved::default();
        for &id in added {
            changes.add(id);
        }
        for &id in removed {
            changes.remove(id);
        }
        changes
    }

    fn drain(cursor: &mut EntityTokenIndexCursor) -> Vec<u64> {
        let mut out = Vec::new();
        while cursor.next().unwrap() {
            out.push(cursor.entity());
        }
        out
    }

    #[test]
    fn test_unordered_yields_each_entity_once() {
        let index = index_with(&[1, 5, 9, 200]);
        let changes = tx(&[5, 7], &[9]);
        let mut cursor = EntityTokenIndexCursor::new();
        cursor
            .initialize(&index, TOKEN, IndexOrder::Unordered, Some(&changes))
            .unwrap();
        assert_eq!(drain(&mut cursor), vec![5, 7, 1, 200]);
    }

    #[test]
    fn test_ordered_merge_in_both_directions() {
        let index = index_with(&[1, 64, 130]);
        let changes = tx(&[2, 100, 131], &[64]);
        let mut cursor = EntityTokenIndexCursor::new();

        cursor
            .initialize(&index, TOKEN, IndexOrder::Ascending, Some(&changes))
            .unwrap();
        assert_eq!(drain(&mut cursor), vec![1, 2, 100, 130, 131]);

        cursor
            .initialize(&index, TOKEN, IndexOrder::Descending, Some(&changes))
            .unwrap();
        assert_eq!(drain(&mut cursor), vec![131, 130, 100, 2, 1]);
    }

    #[test]
    fn test_skip_until_applies_to_both_sides() {
        let committed: Vec<u64> = (0..1000).step_by(10).collect();
        let index = index_with(&committed);
        let changes = tx(&[15, 505, 995], &[510]);
        let mut cursor = EntityTokenIndexCursor::new();
        cursor
            .initialize(&index, TOKEN, IndexOrder::Ascending, Some(&changes))
            .unwrap();

        assert!(cursor.next().unwrap());
        assert_eq!(cursor.entity(), 0);
        cursor.skip_until(500).unwrap();
        let rest = drain(&mut cursor);
        assert_eq!(&rest[..4], &[500, 505, 520, 530]);
        assert_eq!(rest.last(), Some(&995));
    }

    #[test]
    fn test_without_tx_state_matches_index() {
        let index = index_with(&[4, 8, 15, 16, 23, 42]);
        let mut cursor = EntityTokenIndexCursor::new();
        cursor
            .initialize(&index, TOKEN, IndexOrder::Descending, None)
            .unwrap();
        assert_eq!(drain(&mut cursor), vec![42, 23, 16, 15, 8, 4]);
        cursor.close().unwrap();
        cursor.close().unwrap();
        assert!(matches!(
            cursor.initialize(&index, TOKEN, IndexOrder::Ascending, None),
            Err(CursorError::Closed)
        ));
    }
}
