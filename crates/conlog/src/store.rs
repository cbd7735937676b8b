//! In-memory entry storage with retention.
//!
//! [`EntryStore`] is owned by a single session thread and needs no locking.
//! It assigns message numbers at append time, trims from the front when the
//! retention bound is exceeded, and bumps a generation counter on every
//! mutation so derived views know when to recompute.

use std::collections::VecDeque;

use tracing::debug;

use crate::types::Entry;

/// Result of appending to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Index of the new entry after trimming.
    pub index: usize,
    /// Message number assigned to it.
    pub number: u32,
    /// Entries dropped from the front to get back within bounds.
    pub trimmed: usize,
}

/// Ordered, bounded sequence of entries.
#[derive(Debug)]
pub struct EntryStore {
    entries: VecDeque<Entry>,
    /// Retention bound; 0 means unbounded.
    max_entries: usize,
    /// Last assigned message number; 0 right after creation or clear.
    last_number: u32,
    generation: u64,
}

impl EntryStore {
    /// Creates an empty store keeping at most `max_entries` (0 = unbounded).
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
            last_number: 0,
            generation: 0,
        }
    }

    /// Appends an entry, assigning the next message number, then trims.
    pub fn append(&mut self, mut entry: Entry) -> Appended {
        let number = self.next_number();
        entry.number = number;
        self.entries.push_back(entry);
        let trimmed = self.trim();
        self.generation += 1;
        Appended {
            index: self.entries.len() - 1,
            number,
            trimmed,
        }
    }

    /// Increments the repeat count of the last entry.
    ///
    /// Returns its index, or `None` if the store is empty.
    pub fn merge_into_last(&mut self) -> Option<usize> {
        let last = self.entries.back_mut()?;
        last.repeat_count = last.repeat_count.saturating_add(1);
        self.generation += 1;
        Some(self.entries.len() - 1)
    }

    /// Most recently appended entry.
    #[must_use]
    pub fn last(&self) -> Option<&Entry> {
        self.entries.back()
    }

    /// Entry at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    /// Mutable entry at `index`. Bumps the generation.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Entry> {
        self.generation += 1;
        self.entries.get_mut(index)
    }

    /// Iterates over entries in append order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Mutable iteration. Bumps the generation.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.generation += 1;
        self.entries.iter_mut()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry except those matching `retain`, and restarts
    /// numbering so the next appended entry is number 1.
    ///
    /// Returns the number of removed entries.
    pub fn clear(&mut self, retain: Option<&dyn Fn(&Entry) -> bool>) -> usize {
        let before = self.entries.len();
        match retain {
            Some(keep) => self.entries.retain(|e| keep(e)),
            None => self.entries.clear(),
        }
        self.last_number = 0;
        self.generation += 1;
        let removed = before - self.entries.len();
        debug!(removed, kept = self.entries.len(), "cleared entry store");
        removed
    }

    /// Changes the retention bound, trimming immediately.
    ///
    /// Returns the number of entries dropped.
    pub fn set_max_entries(&mut self, max_entries: usize) -> usize {
        self.max_entries = max_entries;
        let trimmed = self.trim();
        if trimmed > 0 {
            self.generation += 1;
        }
        trimmed
    }

    /// Retention bound; 0 means unbounded.
    #[must_use]
    pub const fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Last assigned message number.
    #[must_use]
    pub const fn last_number(&self) -> u32 {
        self.last_number
    }

    /// Mutation counter used for cache invalidation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    fn next_number(&mut self) -> u32 {
        self.last_number = self.last_number.checked_add(1).unwrap_or(1);
        self.last_number
    }

    fn trim(&mut self) -> usize {
        if self.max_entries == 0 || self.entries.len() <= self.max_entries {
            return 0;
        }
        let excess = self.entries.len() - self.max_entries;
        self.entries.drain(..excess);
        excess
    }
}

/// Shifts an index held outside the store after `removed` entries were
/// dropped from the front. Indices into the removed range become `None`.
#[must_use]
pub fn shift_index(index: Option<usize>, removed: usize) -> Option<usize> {
    index.and_then(|i| i.checked_sub(removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use proptest::prelude::*;

    fn make_entry(message: &str) -> Entry {
        Entry::new(message, "", Severity::Info, "t", 0)
    }

    #[test]
    fn append_assigns_increasing_numbers() {
        let mut store = EntryStore::new(100);
        let a = store.append(make_entry("a"));
        let b = store.append(make_entry("b"));
        assert_eq!((a.number, b.number), (1, 2));
        assert_eq!((a.index, b.index), (0, 1));
        assert_eq!(store.get(1).map(|e| e.number), Some(2));
    }

    #[test]
    fn merge_does_not_consume_numbers() {
        let mut store = EntryStore::new(100);
        store.append(make_entry("a"));
        assert_eq!(store.merge_into_last(), Some(0));
        let next = store.append(make_entry("b"));
        assert_eq!(next.number, 2);
        assert_eq!(store.get(0).map(|e| e.repeat_count), Some(2));
    }

    #[test]
    fn merge_on_empty_store_is_none() {
        let mut store = EntryStore::new(100);
        assert_eq!(store.merge_into_last(), None);
    }

    #[test]
    fn clear_restarts_numbering() {
        let mut store = EntryStore::new(100);
        store.append(make_entry("a"));
        store.append(make_entry("b"));
        assert_eq!(store.clear(None), 2);
        assert!(store.is_empty());
        assert_eq!(store.append(make_entry("c")).number, 1);
    }

    #[test]
    fn clear_keeps_retained_entries() {
        let mut store = EntryStore::new(100);
        store.append(make_entry("keep me"));
        store.append(make_entry("drop"));
        store.append(make_entry("keep too"));

        let keep = |e: &Entry| e.content.starts_with("keep");
        assert_eq!(store.clear(Some(&keep)), 1);
        let contents: Vec<&str> = store.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["keep me", "keep too"]);
        assert_eq!(store.append(make_entry("new")).number, 1);
    }

    #[test]
    fn numbering_wraps_to_one() {
        let mut store = EntryStore::new(10);
        store.last_number = u32::MAX - 1;
        assert_eq!(store.append(make_entry("a")).number, u32::MAX);
        assert_eq!(store.append(make_entry("b")).number, 1);
    }

    #[test]
    fn trims_from_front() {
        let mut store = EntryStore::new(5);
        let mut trimmed = 0;
        for i in 0..10 {
            trimmed += store.append(make_entry(&format!("message {i}"))).trimmed;
        }
        assert_eq!(store.len(), 5);
        assert_eq!(trimmed, 5);
        assert_eq!(store.get(0).map(|e| e.content.as_str()), Some("message 5"));
        assert_eq!(store.last().map(|e| e.content.as_str()), Some("message 9"));
    }

    #[test]
    fn shrinking_bound_trims_immediately() {
        let mut store = EntryStore::new(0);
        for i in 0..10 {
            store.append(make_entry(&i.to_string()));
        }
        assert_eq!(store.len(), 10);
        assert_eq!(store.set_max_entries(4), 6);
        assert_eq!(store.get(0).map(|e| e.content.as_str()), Some("6"));
    }

    #[test]
    fn generation_tracks_mutations() {
        let mut store = EntryStore::new(10);
        let g0 = store.generation();
        store.append(make_entry("a"));
        let g1 = store.generation();
        assert!(g1 > g0);
        store.merge_into_last();
        assert!(store.generation() > g1);
        let g2 = store.generation();
        let _ = store.len();
        assert_eq!(store.generation(), g2);
    }

    #[test]
    fn shift_index_after_trim() {
        assert_eq!(shift_index(Some(7), 3), Some(4));
        assert_eq!(shift_index(Some(3), 3), Some(0));
        assert_eq!(shift_index(Some(2), 3), None);
        assert_eq!(shift_index(None, 3), None);
        assert_eq!(shift_index(Some(2), 0), Some(2));
    }

    proptest! {
        #[test]
        fn prop_trim_keeps_most_recent(max in 1usize..20, total in 0usize..60) {
            let mut store = EntryStore::new(max);
            for i in 0..total {
                store.append(make_entry(&i.to_string()));
            }
            let kept: Vec<String> = store.iter().map(|e| e.content.clone()).collect();
            let expected: Vec<String> = (total.saturating_sub(max)..total).map(|i| i.to_string()).collect();
            prop_assert_eq!(kept, expected);
        }
    }
}
