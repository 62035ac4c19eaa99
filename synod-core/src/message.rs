//! Wire messages.
//!
//! Every datagram carries one [`Envelope`]. The data port carries
//! [`PaxosMessage`]s, the control port carries [`ElectionMessage`]s.

use serde::{Deserialize, Serialize};

use crate::{NodeId, ProposalNumber, Slot};

/// Tagged wrapper identifying the sending node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub from: NodeId,
    pub body: M,
}

/// A value accepted under a proposal number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Accepted<V> {
    pub number: ProposalNumber,
    pub value: V,
}

/// Client-level change to the replicated value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent<I> {
    Insert(I),
    Delete(I),
}

/// Data-port messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaxosMessage<V, I> {
    /// Phase 1a.
    Prepare { number: ProposalNumber, slot: Slot },
    /// Phase 1b: the sender promised `number` for `slot`.
    Promise {
        number: ProposalNumber,
        slot: Slot,
        accepted: Option<Accepted<V>>,
    },
    /// Phase 2a.
    Accept {
        number: ProposalNumber,
        slot: Slot,
        value: V,
    },
    /// Phase 2b: the sender accepted `value` under `number`.
    Ack {
        number: ProposalNumber,
        slot: Slot,
        value: V,
    },
    /// `value` is decided for `slot`.
    Commit { slot: Slot, value: V },
    /// A client intent handed to the leader.
    Forward(Intent<I>),
    /// Catch-up request: the sender lacks every slot in `missing` and
    /// everything from `next` on. Peers answer with `Commit`s.
    Sync { next: Slot, missing: Vec<Slot> },
}

impl<V, I> PaxosMessage<V, I> {
    /// Slot the message refers to, if any.
    pub fn slot(&self) -> Option<Slot> {
        match self {
            Self::Prepare { slot, .. }
            | Self::Promise { slot, .. }
            | Self::Accept { slot, .. }
            | Self::Ack { slot, .. }
            | Self::Commit { slot, .. } => Some(*slot),
            Self::Forward(_) | Self::Sync { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prepare { .. } => "prepare",
            Self::Promise { .. } => "promise",
            Self::Accept { .. } => "accept",
            Self::Ack { .. } => "ack",
            Self::Commit { .. } => "commit",
            Self::Forward(_) => "forward",
            Self::Sync { .. } => "sync",
        }
    }
}

/// Control-port messages for the Bully election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElectionMessage {
    /// Sent to every higher id when starting a round.
    Election,
    /// A higher node answered and will take over the round.
    Okay,
    /// The sender claims leadership.
    Coordinator,
}
