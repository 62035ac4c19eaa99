//! Pure proposer state machine - no I/O, no async
//!
//! Tracks the rounds this node is driving, one per slot, and allocates
//! proposal numbers. Timing, retries and replies to callers live in the async
//! unit; this module only decides which transitions are valid.

use std::collections::BTreeMap;

use synod_core::{ProposalNumber, Slot};

/// Allocates strictly increasing, cluster-unique proposal numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ballots {
    rank: u32,
    cluster_size: u32,
    next_round: u64,
}

impl Ballots {
    /// `next_round` is the persisted counter; `0` for a fresh node.
    #[must_use]
    pub fn new(rank: u32, cluster_size: u32, next_round: u64) -> Self {
        Self {
            rank,
            cluster_size,
            next_round,
        }
    }

    /// Take the next number. The caller persists [`Ballots::next_round`]
    /// before using it.
    pub fn next(&mut self) -> ProposalNumber {
        let number = ProposalNumber::new(self.next_round, self.rank, self.cluster_size);
        self.next_round += 1;
        number
    }

    /// Fast-forward so the next number outbids `seen`.
    pub fn observe(&mut self, seen: ProposalNumber) {
        let round = seen.round(self.cluster_size);
        if round >= self.next_round {
            self.next_round = round + 1;
        }
    }

    /// Counter value to persist.
    #[must_use]
    pub fn next_round(&self) -> u64 {
        self.next_round
    }
}

/// Proposer phase
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase<V> {
    /// Collecting promises (phase 1)
    Preparing,
    /// Collecting acks for `value` (phase 2)
    Accepting { value: V },
}

impl<V> Phase<V> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Accepting { .. } => "accepting",
        }
    }
}

/// One in-flight round for a slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Round<V> {
    pub number: ProposalNumber,
    /// The value this node would like to see decided.
    pub value: V,
    pub phase: Phase<V>,
    /// How many times the round was restarted.
    pub attempts: u32,
}

/// Pure proposer state - the in-flight rounds of one node
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProposerCore<V> {
    ballots: Ballots,
    rounds: BTreeMap<Slot, Round<V>>,
}

impl<V: Clone> ProposerCore<V> {
    #[must_use]
    pub fn new(ballots: Ballots) -> Self {
        Self {
            ballots,
            rounds: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn ballots(&self) -> &Ballots {
        &self.ballots
    }

    pub fn observe(&mut self, seen: ProposalNumber) {
        self.ballots.observe(seen);
    }

    #[must_use]
    pub fn rounds(&self) -> &BTreeMap<Slot, Round<V>> {
        &self.rounds
    }

    #[must_use]
    pub fn round(&self, slot: Slot) -> Option<&Round<V>> {
        self.rounds.get(&slot)
    }

    /// First slot at or after `log_next` that this node is not already driving.
    #[must_use]
    pub fn free_slot(&self, log_next: Slot) -> Slot {
        match self.rounds.keys().next_back() {
            Some(last) if *last >= log_next => last.next(),
            _ => log_next,
        }
    }

    /// Start (or restart) a round for `slot`.
    ///
    /// A restart keeps the value the round was started with and counts the
    /// attempt; `value` is only used for a fresh round.
    pub fn begin(&mut self, slot: Slot, value: V) -> ProposalNumber {
        let number = self.ballots.next();
        let round = self.rounds.entry(slot).or_insert_with(|| Round {
            number,
            value,
            phase: Phase::Preparing,
            attempts: 0,
        });
        if round.number != number {
            round.number = number;
            round.phase = Phase::Preparing;
            round.attempts += 1;
        }
        number
    }

    /// Phase 1 reached a majority: move to phase 2 with `value`.
    ///
    /// Returns `false` if the round moved on or the slot is unknown.
    pub fn promised(&mut self, slot: Slot, number: ProposalNumber, value: V) -> bool {
        match self.rounds.get_mut(&slot) {
            Some(round) if round.number == number && matches!(round.phase, Phase::Preparing) => {
                round.phase = Phase::Accepting { value };
                true
            }
            _ => false,
        }
    }

    /// Phase 2 reached a majority for `number`: the round is finished.
    pub fn decided(&mut self, slot: Slot, number: ProposalNumber) -> Option<Round<V>> {
        if self.rounds.get(&slot)?.number != number {
            return None;
        }
        self.rounds.remove(&slot)
    }

    /// The slot was decided elsewhere; drop whatever round was in flight.
    pub fn committed(&mut self, slot: Slot) -> Option<Round<V>> {
        self.rounds.remove(&slot)
    }
}
