//! Bounded multi-producer multi-consumer queue of 64-bit ids.
//!
//! # Design
//!
//! A ring of slots, each carrying a sequence number next to its value. A
//! producer may fill slot `pos % capacity` only when its sequence equals
//! `2 * pos`; a consumer may drain it only when its sequence equals
//! `2 * pos + 1`. Doubling keeps the free and full states distinct even for a
//! single slot. Claiming a position is a CAS on the shared head or tail
//! counter, so neither side ever takes a lock.
//!
//! Values are plain `AtomicU64` slots. The sequence store with `Release`
//! publishes the value written before it; the `Acquire` load on the other
//! side makes it visible.
//!
//! # Invariants
//!
//! - At most `capacity` ids are queued at any time
//! - Every offered id is taken at most once

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Sentinel returned by `take_or_default` callers that have no better default.
pub const NO_ID: u64 = u64::MAX;

struct Slot {
    sequence: AtomicUsize,
    value: AtomicU64,
}

/// A fixed-capacity lock-free id queue.
///
/// # Pre-conditions
/// - `capacity` must be > 0 when creating
///
/// # Invariants
/// - `tail - head <= capacity`
pub struct BoundedIdQueue {
    slots: Box<[Slot]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl BoundedIdQueue {
    /// Create an empty queue holding at most `capacity` ids.
    ///
    /// # Panics
    /// Panics if capacity is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Id queue capacity must be positive");

        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(free_for(i)),
                value: AtomicU64::new(NO_ID),
            })
            .collect();

        Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Append `id` unless the queue is full.
    ///
    /// # Returns
    /// - `true` if the id was queued
    /// - `false` if the queue was full
    pub fn offer(&self, id: u64) -> bool {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos % self.slots.len()];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let lag = signed_distance(sequence, free_for(pos));
            if lag == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.value.store(id, Ordering::Relaxed);
                        slot.sequence.store(filled_at(pos), Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                // The slot still holds an id from the previous lap.
                return false;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Remove the oldest id.
    ///
    /// # Returns
    /// - `Some(id)` if the queue was non-empty
    /// - `None` if the queue was empty
    pub fn take(&self) -> Option<u64> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos % self.slots.len()];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let lag = signed_distance(sequence, filled_at(pos));
            if lag == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let id = slot.value.load(Ordering::Relaxed);
                        slot.sequence.store(
                            free_for(pos.wrapping_add(self.slots.len())),
                            Ordering::Release,
                        );
                        return Some(id);
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Remove the oldest id, or return `default` when empty.
    pub fn take_or_default(&self, default: u64) -> u64 {
        self.take().unwrap_or(default)
    }

    /// Approximate number of queued ids. Exact when no thread is mid-operation.
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.slots.len())
    }

    /// Whether the queue currently looks empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the total capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Sequence of a slot that a producer at `pos` may fill.
const fn free_for(pos: usize) -> usize {
    pos.wrapping_mul(2)
}

/// Sequence of a slot filled by the producer at `pos`.
const fn filled_at(pos: usize) -> usize {
    pos.wrapping_mul(2).wrapping_add(1)
}

#[allow(clippy::cast_possible_wrap)] // positions wrap; the difference is what matters
const fn signed_distance(sequence: usize, expected: usize) -> isize {
    sequence.wrapping_sub(expected) as isize
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;

    use super::*;

    #[test]
    fn test_fill_reject_drain() {
        let queue = BoundedIdQueue::new(4);
        for id in 0..4 {
            assert!(queue.offer(id));
        }
        assert!(!queue.offer(100));
        assert_eq!(queue.len(), 4);

        let drained: Vec<u64> = (0..4).map(|_| queue.take_or_default(NO_ID)).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert_eq!(queue.take_or_default(NO_ID), NO_ID);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wraps_around_many_laps() {
        let queue = BoundedIdQueue::new(3);
        for lap in 0..100u64 {
            assert!(queue.offer(lap));
            assert!(queue.offer(lap + 1000));
            assert_eq!(queue.take(), Some(lap));
            assert_eq!(queue.take(), Some(lap + 1000));
        }
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn test_single_slot_queue() {
        let queue = BoundedIdQueue::new(1);
        assert!(queue.offer(7));
        assert!(!queue.offer(8));
        assert_eq!(queue.take(), Some(7));
        assert!(queue.offer(9));
        assert_eq!(queue.take(), Some(9));
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn test_odd_capacity_respects_bound() {
        let queue = BoundedIdQueue::new(5);
        let accepted = (0..10).filter(|id| queue.offer(*id)).count();
        assert_eq!(accepted, 5);
        assert_eq!(queue.capacity(), 5);
    }

    #[test]
    fn test_concurrent_producers_and_consumers_lose_nothing() {
        const WORKERS: u64 = 4;
        const ITEMS_PER_WORKER: u64 = 10_000;

        let queue = BoundedIdQueue::new(64);

        let mut expected: Vec<u64> = (0..WORKERS * ITEMS_PER_WORKER).collect();
        let mut rng = StdRng::seed_from_u64(42);
        expected.shuffle(&mut rng);
        let chunks: Vec<Vec<u64>> = expected
            .chunks(usize::try_from(ITEMS_PER_WORKER).unwrap())
            .map(<[u64]>::to_vec)
            .collect();

        let mut taken: Vec<u64> = std::thread::scope(|scope| {
            let consumers: Vec<_> = (0..WORKERS)
                .map(|_| {
                    scope.spawn(|| {
                        let mut received = Vec::new();
                        while received.len() < usize::try_from(ITEMS_PER_WORKER).unwrap() {
                            match queue.take() {
                                Some(id) => received.push(id),
                                None => std::thread::yield_now(),
                            }
                        }
                        received
                    })
                })
                .collect();

            for chunk in &chunks {
                let queue = &queue;
                scope.spawn(move || {
                    for id in chunk {
                        while !queue.offer(*id) {
                            std::thread::yield_now();
                        }
                    }
                });
            }

            consumers
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        taken.sort_unstable();
        expected.sort_unstable();
        assert_eq!(taken, expected);
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn test_zero_capacity_panics() {
        let _ = BoundedIdQueue::new(0);
    }
}
