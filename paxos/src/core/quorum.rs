//! Pure quorum tracking - per-slot reply maps that detect majorities
//!
//! Replies are keyed by sender, so duplicated datagrams never count twice.
//! A tally only ever tracks the latest round for a slot; replies for any
//! other number are stale and ignored.

use std::collections::{BTreeMap, BTreeSet};

use synod_core::{Accepted, NodeId, ProposalNumber, Slot};

/// Smallest number of replies that forms a majority of `n` nodes.
#[must_use]
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// A per-slot reply counter driven by the tally units.
pub trait Tally: Send + 'static {
    /// Payload registered with a round.
    type Value: Send + 'static;
    /// Payload carried by each reply.
    type Reply: Send + 'static;
    /// Emitted once per round when a majority is reached.
    type Outcome: Send + 'static;

    fn track(&mut self, slot: Slot, number: ProposalNumber, value: Self::Value);

    /// Count a reply. Returns `false` if it was stale or a duplicate.
    fn record(
        &mut self,
        from: NodeId,
        slot: Slot,
        number: ProposalNumber,
        reply: Self::Reply,
    ) -> bool;

    fn forget(&mut self, slot: Slot);

    /// Remove and return every round that has reached a majority.
    fn scan(&mut self) -> Vec<Self::Outcome>;

    /// Number of rounds being tracked.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pick the value to accept: the highest-numbered accepted value among the
/// promises, otherwise the proposer's own value.
pub fn choose<'a, V: 'a>(
    default: &'a V,
    promises: impl IntoIterator<Item = &'a Option<Accepted<V>>>,
) -> &'a V {
    promises
        .into_iter()
        .flatten()
        .max_by_key(|accepted| accepted.number)
        .map_or(default, |accepted| &accepted.value)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PromiseRound<V> {
    number: ProposalNumber,
    default: V,
    replies: BTreeMap<NodeId, Option<Accepted<V>>>,
}

/// Phase 1 completed for a slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromiseQuorum<V> {
    pub slot: Slot,
    pub number: ProposalNumber,
    /// Value to send in the Accept.
    pub value: V,
    /// Highest accepted number reported by any promise.
    pub highest_accepted: Option<ProposalNumber>,
}

/// Collects Promises per slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PromiseTally<V> {
    majority: usize,
    rounds: BTreeMap<Slot, PromiseRound<V>>,
}

impl<V> PromiseTally<V> {
    #[must_use]
    pub fn new(cluster_size: usize) -> Self {
        Self {
            majority: majority(cluster_size),
            rounds: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn majority(&self) -> usize {
        self.majority
    }

    /// Replies counted so far for `slot`.
    #[must_use]
    pub fn count(&self, slot: Slot) -> usize {
        self.rounds.get(&slot).map_or(0, |r| r.replies.len())
    }
}

impl<V: Clone + Send + 'static> Tally for PromiseTally<V> {
    type Value = V;
    type Reply = Option<Accepted<V>>;
    type Outcome = PromiseQuorum<V>;

    fn track(&mut self, slot: Slot, number: ProposalNumber, default: V) {
        if self.rounds.get(&slot).is_some_and(|r| r.number >= number) {
            return;
        }
        self.rounds.insert(
            slot,
            PromiseRound {
                number,
                default,
                replies: BTreeMap::new(),
            },
        );
    }

    fn record(
        &mut self,
        from: NodeId,
        slot: Slot,
        number: ProposalNumber,
        accepted: Option<Accepted<V>>,
    ) -> bool {
        match self.rounds.get_mut(&slot) {
            Some(round) if round.number == number && !round.replies.contains_key(&from) => {
                round.replies.insert(from, accepted);
                true
            }
            _ => false,
        }
    }

    fn forget(&mut self, slot: Slot) {
        self.rounds.remove(&slot);
    }

    fn scan(&mut self) -> Vec<PromiseQuorum<V>> {
        let ready: Vec<Slot> = self
            .rounds
            .iter()
            .filter(|(_, round)| round.replies.len() >= self.majority)
            .map(|(slot, _)| *slot)
            .collect();

        ready
            .into_iter()
            .filter_map(|slot| self.rounds.remove(&slot).map(|round| (slot, round)))
            .map(|(slot, round)| PromiseQuorum {
                slot,
                number: round.number,
                value: choose(&round.default, round.replies.values()).clone(),
                highest_accepted: round
                    .replies
                    .values()
                    .flatten()
                    .map(|accepted| accepted.number)
                    .max(),
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.rounds.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AckRound<V> {
    number: ProposalNumber,
    value: V,
    acks: BTreeSet<NodeId>,
}

/// Phase 2 completed for a slot: the value is decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckQuorum<V> {
    pub slot: Slot,
    pub number: ProposalNumber,
    pub value: V,
}

/// Collects Acks per slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AckTally<V> {
    majority: usize,
    rounds: BTreeMap<Slot, AckRound<V>>,
}

impl<V> AckTally<V> {
    #[must_use]
    pub fn new(cluster_size: usize) -> Self {
        Self {
            majority: majority(cluster_size),
            rounds: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn count(&self, slot: Slot) -> usize {
        self.rounds.get(&slot).map_or(0, |r| r.acks.len())
    }
}

impl<V: Clone + Eq + Send + 'static> Tally for AckTally<V> {
    type Value = V;
    type Reply = V;
    type Outcome = AckQuorum<V>;

    fn track(&mut self, slot: Slot, number: ProposalNumber, value: V) {
        if self.rounds.get(&slot).is_some_and(|r| r.number >= number) {
            return;
        }
        self.rounds.insert(
            slot,
            AckRound {
                number,
                value,
                acks: BTreeSet::new(),
            },
        );
    }

    fn record(&mut self, from: NodeId, slot: Slot, number: ProposalNumber, value: V) -> bool {
        match self.rounds.get_mut(&slot) {
            Some(round) if round.number == number && round.value == value => round.acks.insert(from),
            _ => false,
        }
    }

    fn forget(&mut self, slot: Slot) {
        self.rounds.remove(&slot);
    }

    fn scan(&mut self) -> Vec<AckQuorum<V>> {
        let ready: Vec<Slot> = self
            .rounds
            .iter()
            .filter(|(_, round)| round.acks.len() >= self.majority)
            .map(|(slot, _)| *slot)
            .collect();

        ready
            .into_iter()
            .filter_map(|slot| {
                self.rounds.remove(&slot).map(|round| AckQuorum {
                    slot,
                    number: round.number,
                    value: round.value,
                })
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.rounds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(x: u64) -> ProposalNumber {
        ProposalNumber(x)
    }

    fn acc(number: u64, value: &str) -> Option<Accepted<String>> {
        Some(Accepted {
            number: n(number),
            value: value.to_owned(),
        })
    }

    #[test]
    fn majority_for_one_to_seven() {
        let expected = [1, 2, 2, 3, 3, 4, 4];
        for (size, want) in (1..=7).zip(expected) {
            assert_eq!(majority(size), want, "N = {size}");
            // Two majorities always intersect.
            assert!(2 * majority(size) > size);
        }
    }

    #[test]
    fn exactly_majority_replies_complete_phase_one() {
        for size in 1..=7usize {
            let mut tally = PromiseTally::new(size);
            tally.track(Slot(0), n(1), "mine".to_owned());
            let needed = majority(size);
            for i in 0..needed {
                assert!(tally.scan().is_empty(), "N = {size}: completed after {i}");
                let from = NodeId(u32::try_from(i).unwrap());
                assert!(tally.record(from, Slot(0), n(1), None));
            }
            let done = tally.scan();
            assert_eq!(done.len(), 1, "N = {size}");
            assert_eq!(done[0].value, "mine");
            assert!(tally.is_empty());
        }
    }

    #[test]
    fn duplicate_promises_count_once() {
        let mut tally = PromiseTally::new(3);
        tally.track(Slot(0), n(4), "v".to_owned());
        assert!(tally.record(NodeId(1), Slot(0), n(4), None));
        assert!(!tally.record(NodeId(1), Slot(0), n(4), None));
        assert_eq!(tally.count(Slot(0)), 1);
        assert!(tally.scan().is_empty());
    }

    #[test]
    fn stale_promises_are_ignored() {
        let mut tally = PromiseTally::new(3);
        tally.track(Slot(0), n(4), "v".to_owned());
        assert!(!tally.record(NodeId(1), Slot(0), n(3), None));
        assert!(!tally.record(NodeId(1), Slot(1), n(4), None));
        assert_eq!(tally.count(Slot(0)), 0);
    }

    #[test]
    fn newer_round_replaces_older() {
        let mut tally = PromiseTally::new(3);
        tally.track(Slot(0), n(4), "v".to_owned());
        tally.record(NodeId(1), Slot(0), n(4), None);
        tally.track(Slot(0), n(7), "v".to_owned());
        assert_eq!(tally.count(Slot(0)), 0);
        // An older registration arriving late does not roll back.
        tally.track(Slot(0), n(4), "v".to_owned());
        assert!(tally.record(NodeId(1), Slot(0), n(7), None));
        assert!(!tally.record(NodeId(2), Slot(0), n(4), None));
    }

    #[test]
    fn adopts_highest_accepted_value() {
        let mut tally = PromiseTally::new(5);
        tally.track(Slot(2), n(20), "mine".to_owned());
        tally.record(NodeId(1), Slot(2), n(20), acc(6, "old"));
        tally.record(NodeId(2), Slot(2), n(20), None);
        tally.record(NodeId(3), Slot(2), n(20), acc(11, "newer"));
        let done = tally.scan();
        assert_eq!(
            done,
            vec![PromiseQuorum {
                slot: Slot(2),
                number: n(20),
                value: "newer".to_owned(),
                highest_accepted: Some(n(11)),
            }]
        );
    }

    #[test]
    fn choose_falls_back_to_default() {
        let promises: [Option<Accepted<&str>>; 2] = [None, None];
        assert_eq!(choose(&"default", &promises), &"default");
    }

    #[test]
    fn forget_drops_round() {
        let mut tally = PromiseTally::new(1);
        tally.track(Slot(0), n(1), 0u8);
        tally.forget(Slot(0));
        assert!(!tally.record(NodeId(0), Slot(0), n(1), None));
        assert!(tally.scan().is_empty());
    }

    #[test]
    fn two_acks_of_three_decide() {
        let mut tally = AckTally::new(3);
        tally.track(Slot(0), n(3), "V1".to_owned());
        assert!(tally.record(NodeId(1), Slot(0), n(3), "V1".to_owned()));
        assert!(tally.scan().is_empty());
        assert!(tally.record(NodeId(2), Slot(0), n(3), "V1".to_owned()));
        assert_eq!(
            tally.scan(),
            vec![AckQuorum {
                slot: Slot(0),
                number: n(3),
                value: "V1".to_owned()
            }]
        );
        // The third ack arrives after the decision and is ignored.
        assert!(!tally.record(NodeId(3), Slot(0), n(3), "V1".to_owned()));
    }

    #[test]
    fn acks_for_other_rounds_do_not_count() {
        let mut tally = AckTally::new(3);
        tally.track(Slot(0), n(3), "V1".to_owned());
        assert!(!tally.record(NodeId(1), Slot(0), n(2), "V1".to_owned()));
        assert!(!tally.record(NodeId(1), Slot(0), n(3), "V2".to_owned()));
        assert!(tally.record(NodeId(1), Slot(0), n(3), "V1".to_owned()));
        assert!(!tally.record(NodeId(1), Slot(0), n(3), "V1".to_owned()));
        assert_eq!(tally.count(Slot(0)), 1);
    }

    #[test]
    fn slots_complete_independently() {
        let mut tally = AckTally::new(3);
        tally.track(Slot(0), n(1), 'a');
        tally.track(Slot(1), n(1), 'b');
        tally.record(NodeId(0), Slot(1), n(1), 'b');
        tally.record(NodeId(1), Slot(1), n(1), 'b');
        tally.record(NodeId(0), Slot(0), n(1), 'a');
        let done = tally.scan();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].slot, Slot(1));
        assert_eq!(tally.len(), 1);
    }
}
