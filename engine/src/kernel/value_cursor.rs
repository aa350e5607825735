//! Value index cursor that overlays the running transaction's changes.
//!
//! # Invariants
//!
//! - No entity is produced twice by one initialization
//! - Entities the transaction removed are never produced from the index
//! - The removed set is the one seen at initialization
//! - An index that already holds the transaction's changes is never
//!   overlaid with them again

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use crate::index::{
    IndexOrder, IndexProgressor, NO_ENTITY, ValueIndex, ValueIndexProgressor, ValueKey, ValueQuery,
};
use crate::kernel::{CursorError, ValueChanges};

/// Authoritative property values, used to drop index hits that no longer
/// hold because the index lags behind the store.
pub trait PropertyReader {
    fn property_value(&self, entity: u64) -> Option<i64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    /// Unordered: producing transaction additions.
    TxState,
    /// Unordered: producing index hits.
    IndexOnly,
    /// Sorted merge of both sides.
    Ordered,
    Exhausted,
    Closed,
}

pub struct EntityValueIndexCursor<'a> {
    state: State,
    order: IndexOrder,
    query: ValueQuery,
    progressor: Option<ValueIndexProgressor>,
    /// Transaction additions in output order.
    added: Vec<ValueKey>,
    added_pos: usize,
    added_ids: HashSet<u64>,
    removed: BTreeSet<u64>,
    store_filter: Option<&'a dyn PropertyReader>,
    index_peek: Option<ValueKey>,
    index_done: bool,
    current: Option<ValueKey>,
    /// The index was built with the transaction's changes applied.
    index_includes_tx_state: bool,
}

impl Default for EntityValueIndexCursor<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> EntityValueIndexCursor<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Uninitialized,
            order: IndexOrder::Unordered,
            query: ValueQuery::Exists,
            progressor: None,
            added: Vec::new(),
            added_pos: 0,
            added_ids: HashSet::new(),
            removed: BTreeSet::new(),
            store_filter: None,
            index_peek: None,
            index_done: false,
            current: None,
            index_includes_tx_state: false,
        }
    }

    /// Mark the index this cursor reads as already holding the
    /// transaction's changes, so `initialize` ignores the `tx` it is given.
    #[must_use]
    pub const fn with_index_including_tx_state(mut self, includes: bool) -> Self {
        self.index_includes_tx_state = includes;
        self
    }

    /// Start a query, snapshotting `tx` if given and the index does not
    /// already include it.
    ///
    /// Exact queries look their additions up directly; other queries filter
    /// the additions by the predicate. With `store_filter` every index hit
    /// is re-checked against the current property value.
    ///
    /// A cursor can be initialized again until it is closed.
    pub fn initialize(
        &mut self,
        index: &ValueIndex,
        query: ValueQuery,
        order: IndexOrder,
        tx: Option<&ValueChanges>,
        store_filter: Option<&'a dyn PropertyReader>,
    ) -> Result<(), CursorError> {
        if self.state == State::Closed {
            return Err(CursorError::Closed);
        }
        if let Some(mut previous) = self.progressor.take() {
            previous.close()?;
        }

        let tx = tx.filter(|_| !self.index_includes_tx_state);
        self.added = match (tx, &query) {
            (Some(changes), ValueQuery::Exact(value)) => changes
                .added_with_value(*value)
                .into_iter()
                .map(|entity| ValueKey::new(*value, entity))
                .collect(),
            (Some(changes), _) => changes.added_matching(&query),
            (None, _) => Vec::new(),
        };
        if order == IndexOrder::Descending {
            self.added.reverse();
        }
        self.added_ids = self.added.iter().map(|key| key.entity).collect();
        self.removed = tx.map(|changes| changes.removed().clone()).unwrap_or_default();
        self.added_pos = 0;
        self.store_filter = store_filter;
        self.index_peek = None;
        self.index_done = false;
        self.current = None;
        self.progressor = Some(index.seek(&query, order));
        self.query = query;
        self.order = order;
        self.state = if order == IndexOrder::Unordered {
            State::TxState
        } else {
            State::Ordered
        };
        Ok(())
    }

    pub fn next(&mut self) -> Result<bool, CursorError> {
        loop {
            match self.state {
                State::TxState => {
                    if let Some(key) = self.added.get(self.added_pos).copied() {
                        self.added_pos += 1;
                        self.current = Some(key);
                        return Ok(true);
                    }
                    self.state = State::IndexOnly;
                }
                State::IndexOnly => {
                    if let Some(key) = self.next_accepted_hit()? {
                        self.current = Some(key);
                        return Ok(true);
                    }
                    self.finish();
                    return Ok(false);
                }
                State::Ordered => return self.next_ordered(),
                State::Uninitialized | State::Exhausted | State::Closed => return Ok(false),
            }
        }
    }

    fn next_ordered(&mut self) -> Result<bool, CursorError> {
        if self.index_peek.is_none() && !self.index_done {
            self.index_peek = self.next_accepted_hit()?;
            self.index_done = self.index_peek.is_none();
        }
        let tx = self.added.get(self.added_pos).copied();
        let take_tx = match (tx, self.index_peek) {
            (None, None) => {
                self.finish();
                return Ok(false);
            }
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(tx), Some(hit)) => {
                let ordering = tx.cmp(&hit);
                if self.order == IndexOrder::Descending {
                    ordering == Ordering::Greater
                } else {
                    ordering == Ordering::Less
                }
            }
        };
        if take_tx {
            self.added_pos += 1;
            self.current = tx;
        } else {
            self.current = self.index_peek.take();
        }
        Ok(true)
    }

    /// Pull index hits until one passes `accept_entity`.
    fn next_accepted_hit(&mut self) -> Result<Option<ValueKey>, CursorError> {
        loop {
            let Some(progressor) = self.progressor.as_mut() else {
                return Ok(None);
            };
            if !progressor.next()? {
                return Ok(None);
            }
            match progressor.hit() {
                Some(hit) if self.accept_entity(hit) => return Ok(Some(hit)),
                _ => {}
            }
        }
    }

    fn accept_entity(&self, hit: ValueKey) -> bool {
        if self.removed.contains(&hit.entity) || self.added_ids.contains(&hit.entity) {
            return false;
        }
        self.store_filter.is_none_or(|store| {
            store
                .property_value(hit.entity)
                .is_some_and(|value| value == hit.value && self.query.matches(value))
        })
    }

    fn finish(&mut self) {
        self.state = State::Exhausted;
        self.current = None;
    }

    /// Current entity, `NO_ENTITY` when not positioned.
    #[must_use]
    pub fn entity(&self) -> u64 {
        self.current.map_or(NO_ENTITY, |key| key.entity)
    }

    #[must_use]
    pub fn value(&self) -> Option<i64> {
        self.current.map(|key| key.value)
    }

    /// Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), CursorError> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.state = State::Closed;
        self.current = None;
        self.added.clear();
        if let Some(mut progressor) = self.progressor.take() {
            progressor.close()?;
        }
        Ok(())
    }
}
