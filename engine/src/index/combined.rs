//! K-way merge over partitioned seekers.

use std::cmp::Ordering;

use tracing::warn;

use crate::index::IndexOrder;
use crate::index::layout::Layout;
use crate::index::seeker::Seeker;
use crate::index::tree::TreeError;

/// Merges seekers over disjoint partitions into one ordered stream.
///
/// # Invariants
///
/// - If every part yields keys in `order`, so does the combined seeker
/// - Equal keys come out in partition order
/// - `close()` closes every part, whatever the others do
pub struct CombinedSeeker<'a, L: Layout, S> {
    layout: &'a L,
    order: IndexOrder,
    parts: Vec<S>,
    /// `None` until a part is primed, then whether it holds an entry.
    positioned: Vec<Option<bool>>,
    current: Option<usize>,
    closed: bool,
}

impl<'a, L, S> CombinedSeeker<'a, L, S>
where
    L: Layout,
    S: Seeker<Key = L::Key, Value = L::Value>,
{
    #[must_use]
    pub fn new(layout: &'a L, order: IndexOrder, parts: Vec<S>) -> Self {
        let positioned = vec![None; parts.len()];
        Self {
            layout,
            order,
            parts,
            positioned,
            current: None,
            closed: false,
        }
    }

    /// Partition the current entry came from.
    #[must_use]
    pub const fn current_part(&self) -> Option<usize> {
        self.current
    }

    fn current_seeker(&self) -> Option<&S> {
        self.current.map(|index| &self.parts[index])
    }

    fn better(&self, candidate: usize, best: usize) -> bool {
        let (Some(candidate_key), Some(best_key)) = (self.parts[candidate].key(), self.parts[best].key()) else {
            return false;
        };
        let ordering = self.layout.compare(candidate_key, best_key);
        match self.order {
            IndexOrder::Descending => ordering == Ordering::Greater,
            IndexOrder::Ascending | IndexOrder::Unordered => ordering == Ordering::Less,
        }
    }
}

impl<L, S> Seeker for CombinedSeeker<'_, L, S>
where
    L: Layout,
    S: Seeker<Key = L::Key, Value = L::Value>,
{
    type Key = L::Key;
    type Value = L::Value;

    fn next(&mut self) -> Result<bool, TreeError> {
        if self.closed {
            return Ok(false);
        }
        if let Some(index) = self.current.take() {
            self.positioned[index] = Some(self.parts[index].next()?);
        }
        for index in 0..self.parts.len() {
            if self.positioned[index].is_none() {
                self.positioned[index] = Some(self.parts[index].next()?);
            }
        }

        let mut best: Option<usize> = None;
        for index in 0..self.parts.len() {
            if self.positioned[index] != Some(true) {
                continue;
            }
            // Strictly better only, so ties stay with the earlier partition.
            if best.is_none_or(|b| self.better(index, b)) {
                best = Some(index);
            }
        }
        self.current = best;
        Ok(best.is_some())
    }

    fn key(&self) -> Option<&L::Key> {
        self.current_seeker().and_then(Seeker::key)
    }

    fn value(&self) -> Option<&L::Value> {
        self.current_seeker().and_then(Seeker::value)
    }

    fn close(&mut self) -> Result<(), TreeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.current = None;

        let mut failures: Vec<TreeError> = self
            .parts
            .iter_mut()
            .filter_map(|part| part.close().err())
            .collect();
        if failures.is_empty() {
            return Ok(());
        }
        let first = failures.remove(0);
        if failures.is_empty() {
            return Err(first);
        }
        warn!(
            failed = failures.len() + 1,
            parts = self.parts.len(),
            error = %first,
            "several partitions failed to close"
        );
        Err(TreeError::MultipleCloseFailures {
            first: Box::new(first),
            suppressed: failures,
        })
    }
}
