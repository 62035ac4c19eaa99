//! Pure acceptor state machine - no I/O, no async
//!
//! Each slot is an independent Synod instance, so the acceptor keeps one
//! [`SlotState`] per slot. Neither the promised nor the accepted number of a
//! slot ever decreases.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use synod_core::{Accepted, ProposalNumber, Slot};

/// Durable acceptor state for a single slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotState<V> {
    /// Highest number promised or accepted; `None` is below every number.
    pub max_prepare: Option<ProposalNumber>,
    /// Highest-numbered proposal accepted.
    pub accepted: Option<Accepted<V>>,
}

impl<V> Default for SlotState<V> {
    fn default() -> Self {
        Self {
            max_prepare: None,
            accepted: None,
        }
    }
}

impl<V> SlotState<V> {
    /// Short name of the state, for introspection.
    #[must_use]
    pub fn phase(&self) -> &'static str {
        match (&self.max_prepare, &self.accepted) {
            (None, _) => "unpromised",
            (Some(_), None) => "promised",
            (Some(_), Some(_)) => "accepted",
        }
    }
}

/// Result of handling a Prepare request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareResult<V> {
    /// Promised; carries the currently accepted pair to report back.
    Promised { accepted: Option<Accepted<V>> },
    /// Not strictly above the current promise.
    Rejected { promised: ProposalNumber },
}

/// Result of handling an Accept request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptResult {
    Accepted,
    /// Below the current promise.
    Rejected { promised: ProposalNumber },
}

/// Pure acceptor state - per-slot promises and accepted values
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AcceptorCore<V> {
    slots: BTreeMap<Slot, SlotState<V>>,
}

impl<V> Default for AcceptorCore<V> {
    fn default() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }
}

impl<V: Clone> AcceptorCore<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted slot states.
    #[must_use]
    pub fn from_slots(slots: BTreeMap<Slot, SlotState<V>>) -> Self {
        Self { slots }
    }

    #[must_use]
    pub fn get(&self, slot: Slot) -> Option<&SlotState<V>> {
        self.slots.get(&slot)
    }

    #[must_use]
    pub fn slots(&self) -> &BTreeMap<Slot, SlotState<V>> {
        &self.slots
    }

    /// Drop a decided slot. Its promise can never matter again.
    pub fn forget(&mut self, slot: Slot) -> Option<SlotState<V>> {
        self.slots.remove(&slot)
    }

    /// Handle a Prepare: promise if `number` is strictly above the slot's
    /// current promise.
    pub fn prepare(&mut self, slot: Slot, number: ProposalNumber) -> PrepareResult<V> {
        let state = self.slots.entry(slot).or_default();
        match state.max_prepare {
            Some(promised) if promised >= number => PrepareResult::Rejected { promised },
            _ => {
                state.max_prepare = Some(number);
                PrepareResult::Promised {
                    accepted: state.accepted.clone(),
                }
            }
        }
    }

    /// Handle an Accept: accept if `number` is at least the slot's current
    /// promise. Accepting also raises the promise to `number`.
    pub fn accept(&mut self, slot: Slot, number: ProposalNumber, value: V) -> AcceptResult {
        let state = self.slots.entry(slot).or_default();
        match state.max_prepare {
            Some(promised) if promised > number => AcceptResult::Rejected { promised },
            _ => {
                state.max_prepare = Some(number);
                state.accepted = Some(Accepted { number, value });
                AcceptResult::Accepted
            }
        }
    }
}
