//! Id-keyed store of live entries with min-deadline lookup.
//!
//! An ordered map from auction id to entry, paired with a min-heap over
//! `(deadline, id)` so the loop thread can ask "what expires next?" and pop
//! everything due in one sweep. Removal leaves a stale heap node behind;
//! stale nodes are recognized (the live deadline no longer matches) and
//! discarded when they surface, so erase stays O(log n) without heap
//! surgery.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use minstant::Instant;
use thiserror::Error;

/// Insert rejected because the id is already present.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("duplicate id in deadline index")]
pub struct Duplicate;

struct Timed<V> {
    value: V,
    deadline: Instant,
}

/// Mapping id → entry with a secondary min-heap keyed by deadline.
///
/// Invariant: an id is present iff its entry has neither completed nor
/// expired — the caller removes on completion, [`expire`] removes on
/// deadline.
///
/// [`expire`]: DeadlineIndex::expire
pub struct DeadlineIndex<K, V> {
    entries: BTreeMap<K, Timed<V>>,
    deadlines: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K: Ord + Clone, V> DeadlineIndex<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, id: &K) -> bool {
        self.entries.contains_key(id)
    }

    /// Borrow the entry for `id`, if live.
    #[must_use]
    pub fn get(&self, id: &K) -> Option<&V> {
        self.entries.get(id).map(|t| &t.value)
    }

    /// Mutably borrow the entry for `id`, if live.
    #[must_use]
    pub fn get_mut(&mut self, id: &K) -> Option<&mut V> {
        self.entries.get_mut(id).map(|t| &mut t.value)
    }

    /// Inserts an entry with an absolute deadline.
    ///
    /// # Errors
    ///
    /// Fails with [`Duplicate`] if the id is already present; the index is
    /// unchanged in that case.
    pub fn insert(&mut self, id: K, value: V, deadline: Instant) -> Result<(), Duplicate> {
        if self.entries.contains_key(&id) {
            return Err(Duplicate);
        }
        self.deadlines.push(Reverse((deadline, id.clone())));
        self.entries.insert(id, Timed { value, deadline });
        Ok(())
    }

    /// Removes and returns the entry for `id`.
    ///
    /// The heap node for the entry goes stale and is discarded whenever it
    /// next surfaces.
    pub fn remove(&mut self, id: &K) -> Option<V> {
        self.entries.remove(id).map(|t| t.value)
    }

    /// The minimum deadline among live entries, or `None` when empty.
    ///
    /// Prunes stale heap nodes off the top; amortized O(1).
    pub fn earliest(&mut self) -> Option<Instant> {
        self.prune_stale();
        self.deadlines.peek().map(|Reverse((dl, _))| *dl)
    }

    /// Removes every entry whose deadline is at or before `now`, invoking
    /// `on_expired(id, entry)` for each in deadline order.
    pub fn expire(&mut self, now: Instant, mut on_expired: impl FnMut(K, V)) {
        loop {
            self.prune_stale();
            match self.deadlines.peek() {
                Some(Reverse((dl, _))) if *dl <= now => {}
                _ => return,
            }
            let Reverse((_, id)) = self.deadlines.pop().expect("peeked above");
            if let Some(timed) = self.entries.remove(&id) {
                on_expired(id, timed.value);
            }
        }
    }

    /// Drops heap nodes whose entry was removed or re-armed.
    fn prune_stale(&mut self) {
        loop {
            let live = match self.deadlines.peek() {
                Some(Reverse((dl, id))) => self
                    .entries
                    .get(id)
                    .is_some_and(|timed| timed.deadline == *dl),
                None => return,
            };
            if live {
                return;
            }
            self.deadlines.pop();
        }
    }
}

impl<K: Ord + Clone, V> Default for DeadlineIndex<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base() -> Instant {
        Instant::now()
    }

    #[test]
    fn insert_and_lookup() {
        let now = base();
        let mut idx = DeadlineIndex::new();
        idx.insert(7u64, "entry", now + Duration::from_millis(10))
            .unwrap();

        assert_eq!(idx.len(), 1);
        assert!(idx.contains(&7));
        assert_eq!(idx.get(&7), Some(&"entry"));
        assert!(!idx.contains(&8));
    }

    #[test]
    fn duplicate_insert_rejected() {
        let now = base();
        let mut idx = DeadlineIndex::new();
        idx.insert(42u64, 1, now).unwrap();
        assert_eq!(idx.insert(42, 2, now), Err(Duplicate));

        // Original entry untouched.
        assert_eq!(idx.get(&42), Some(&1));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn earliest_tracks_minimum() {
        let now = base();
        let mut idx = DeadlineIndex::new();
        idx.insert(1u64, (), now + Duration::from_millis(50)).unwrap();
        idx.insert(2u64, (), now + Duration::from_millis(10)).unwrap();
        idx.insert(3u64, (), now + Duration::from_millis(30)).unwrap();

        assert_eq!(idx.earliest(), Some(now + Duration::from_millis(10)));

        idx.remove(&2);
        assert_eq!(idx.earliest(), Some(now + Duration::from_millis(30)));
    }

    #[test]
    fn expire_pops_due_entries_in_order() {
        let now = base();
        let mut idx = DeadlineIndex::new();
        idx.insert(1u64, "a", now + Duration::from_millis(5)).unwrap();
        idx.insert(2u64, "b", now + Duration::from_millis(1)).unwrap();
        idx.insert(3u64, "c", now + Duration::from_millis(100)).unwrap();

        let mut fired = Vec::new();
        idx.expire(now + Duration::from_millis(10), |id, v| fired.push((id, v)));

        assert_eq!(fired, vec![(2, "b"), (1, "a")]);
        assert_eq!(idx.len(), 1);
        assert!(idx.contains(&3));
    }

    #[test]
    fn deadline_equal_to_now_expires() {
        let now = base();
        let deadline = now + Duration::from_millis(10);
        let mut idx = DeadlineIndex::new();
        idx.insert(9u64, (), deadline).unwrap();

        let mut fired = 0;
        idx.expire(deadline, |_, ()| fired += 1);
        assert_eq!(fired, 1);
        assert!(idx.is_empty());
    }

    #[test]
    fn removed_entry_never_expires() {
        let now = base();
        let mut idx = DeadlineIndex::new();
        idx.insert(5u64, "gone", now + Duration::from_millis(1)).unwrap();
        assert_eq!(idx.remove(&5), Some("gone"));

        let mut fired = 0;
        idx.expire(now + Duration::from_secs(1), |_, _| fired += 1);
        assert_eq!(fired, 0);
    }

    #[test]
    fn reinsert_after_removal_uses_new_deadline() {
        let now = base();
        let mut idx = DeadlineIndex::new();
        idx.insert(5u64, "first", now + Duration::from_millis(1)).unwrap();
        idx.remove(&5);
        idx.insert(5u64, "second", now + Duration::from_millis(100)).unwrap();

        // The stale node for the first insertion must not expire the second.
        let mut fired = Vec::new();
        idx.expire(now + Duration::from_millis(10), |id, v| fired.push((id, v)));
        assert!(fired.is_empty());
        assert_eq!(idx.get(&5), Some(&"second"));

        idx.expire(now + Duration::from_millis(100), |id, v| fired.push((id, v)));
        assert_eq!(fired, vec![(5, "second")]);
    }

    #[test]
    fn earliest_empty_is_none() {
        let mut idx: DeadlineIndex<u64, ()> = DeadlineIndex::new();
        assert_eq!(idx.earliest(), None);
    }
}
