//! The committed log.

use std::collections::BTreeMap;

use synod_core::Slot;

/// Outcome of recording a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded<V> {
    /// First time this slot was decided locally.
    New,
    /// Same value as already recorded.
    Duplicate,
    /// A different value is already recorded; the log was not changed.
    Conflict { existing: V },
}

/// Decided values by slot. A recorded slot is never overwritten.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedLog<V> {
    entries: BTreeMap<Slot, V>,
}

impl<V> Default for CommittedLog<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V: Clone + Eq + Default> CommittedLog<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_entries(entries: BTreeMap<Slot, V>) -> Self {
        Self { entries }
    }

    pub fn record(&mut self, slot: Slot, value: V) -> Recorded<V> {
        match self.entries.get(&slot) {
            Some(existing) if *existing == value => Recorded::Duplicate,
            Some(existing) => Recorded::Conflict {
                existing: existing.clone(),
            },
            None => {
                self.entries.insert(slot, value);
                Recorded::New
            }
        }
    }

    #[must_use]
    pub fn get(&self, slot: Slot) -> Option<&V> {
        self.entries.get(&slot)
    }

    #[must_use]
    pub fn contains(&self, slot: Slot) -> bool {
        self.entries.contains_key(&slot)
    }

    #[must_use]
    pub fn highest(&self) -> Option<Slot> {
        self.entries.keys().next_back().copied()
    }

    /// First slot above every committed one.
    #[must_use]
    pub fn next_slot(&self) -> Slot {
        self.highest().map_or(Slot(0), Slot::next)
    }

    /// The value at the highest committed slot, or the initial value.
    #[must_use]
    pub fn current_value(&self) -> V {
        self.entries
            .values()
            .next_back()
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Uncommitted slots below the highest committed one.
    pub fn gaps(&self) -> impl Iterator<Item = Slot> + '_ {
        let mut expected = 0;
        self.entries.keys().flat_map(move |slot| {
            let gap = (expected..slot.0).map(Slot);
            expected = slot.0 + 1;
            gap
        })
    }

    /// Committed slots from `slot` on.
    pub fn since(&self, slot: Slot) -> impl Iterator<Item = (Slot, &V)> {
        self.entries.range(slot..).map(|(slot, value)| (*slot, value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, &V)> {
        self.entries.iter().map(|(slot, value)| (*slot, value))
    }

    #[must_use]
    pub fn entries(&self) -> &BTreeMap<Slot, V> {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log() {
        let log = CommittedLog::<Vec<u8>>::new();
        assert_eq!(log.highest(), None);
        assert_eq!(log.next_slot(), Slot(0));
        assert_eq!(log.current_value(), Vec::<u8>::new());
    }

    #[test]
    fn commit_is_idempotent() {
        let mut log = CommittedLog::new();
        assert_eq!(log.record(Slot(0), "V1".to_owned()), Recorded::New);
        assert_eq!(log.record(Slot(0), "V1".to_owned()), Recorded::Duplicate);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn conflicting_commit_never_overwrites() {
        let mut log = CommittedLog::new();
        log.record(Slot(0), "V1".to_owned());
        assert_eq!(
            log.record(Slot(0), "V2".to_owned()),
            Recorded::Conflict {
                existing: "V1".to_owned()
            }
        );
        assert_eq!(log.get(Slot(0)).map(String::as_str), Some("V1"));
    }

    #[test]
    fn current_value_is_highest_slot() {
        let mut log = CommittedLog::new();
        log.record(Slot(3), "c".to_owned());
        log.record(Slot(0), "a".to_owned());
        assert_eq!(log.current_value(), "c");
        assert_eq!(log.next_slot(), Slot(4));
        assert!(!log.contains(Slot(1)));
        assert_eq!(
            log.iter().map(|(s, _)| s).collect::<Vec<_>>(),
            vec![Slot(0), Slot(3)]
        );
    }

    #[test]
    fn gaps_and_tail() {
        let mut log = CommittedLog::new();
        assert_eq!(log.gaps().count(), 0);
        for slot in [1, 2, 5] {
            log.record(Slot(slot), slot.to_string());
        }
        assert_eq!(log.gaps().collect::<Vec<_>>(), vec![Slot(0), Slot(3), Slot(4)]);
        assert_eq!(
            log.since(Slot(2)).map(|(s, _)| s).collect::<Vec<_>>(),
            vec![Slot(2), Slot(5)]
        );
        assert_eq!(log.since(Slot(6)).count(), 0);
    }
}
