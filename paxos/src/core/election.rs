//! Pure Bully election state machine - no I/O, no async
//!
//! The node with the highest reachable id becomes leader. Every transition
//! returns the [`Output`]s the runtime must perform; the runtime owns the
//! clock and calls [`BullyCore::on_timeout`] when the armed deadline passes.

use synod_core::{ClusterTable, ElectionMessage, NodeId};

/// Elector state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElectionState {
    Idle,
    /// Waiting for higher nodes. `deferred` once one of them answered `Okay`.
    Electing { deferred: bool },
    Leader,
    Follower,
}

/// Side effects requested by a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Output {
    Send(NodeId, ElectionMessage),
    /// Arm (or re-arm) the reply timeout.
    ArmTimer,
    /// Publish a new leader.
    Elected(NodeId),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BullyCore {
    id: NodeId,
    higher: Vec<NodeId>,
    others: Vec<NodeId>,
    state: ElectionState,
    leader: Option<NodeId>,
}

impl BullyCore {
    #[must_use]
    pub fn new(id: NodeId, cluster: &ClusterTable) -> Self {
        Self {
            id,
            higher: cluster.higher_than(id).collect(),
            others: cluster.others(id).collect(),
            state: ElectionState::Idle,
            leader: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ElectionState {
        self.state
    }

    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// Start a round unless one is already running.
    pub fn start_round(&mut self) -> Vec<Output> {
        if matches!(self.state, ElectionState::Electing { .. }) {
            return Vec::new();
        }
        if self.higher.is_empty() {
            return self.win();
        }
        self.state = ElectionState::Electing { deferred: false };
        self.higher
            .iter()
            .map(|id| Output::Send(*id, ElectionMessage::Election))
            .chain([Output::ArmTimer])
            .collect()
    }

    pub fn on_message(&mut self, from: NodeId, message: ElectionMessage) -> Vec<Output> {
        match message {
            ElectionMessage::Election => {
                if from > self.id {
                    return Vec::new();
                }
                let mut out = vec![Output::Send(from, ElectionMessage::Okay)];
                out.extend(self.start_round());
                out
            }
            ElectionMessage::Okay => {
                if from > self.id
                    && let ElectionState::Electing { deferred } = &mut self.state
                {
                    *deferred = true;
                }
                Vec::new()
            }
            ElectionMessage::Coordinator => {
                self.state = ElectionState::Follower;
                let mut out = self.publish(from);
                if from < self.id {
                    out.extend(self.start_round());
                }
                out
            }
        }
    }

    /// The reply timeout armed by the last round elapsed.
    pub fn on_timeout(&mut self) -> Vec<Output> {
        match self.state {
            ElectionState::Electing { deferred: false } => self.win(),
            ElectionState::Electing { deferred: true } => {
                // The higher node answered but never announced itself.
                self.state = ElectionState::Idle;
                self.start_round()
            }
            _ => Vec::new(),
        }
    }

    fn win(&mut self) -> Vec<Output> {
        self.state = ElectionState::Leader;
        let mut out: Vec<Output> = self
            .others
            .iter()
            .map(|id| Output::Send(*id, ElectionMessage::Coordinator))
            .collect();
        out.extend(self.publish(self.id));
        out
    }

    fn publish(&mut self, leader: NodeId) -> Vec<Output> {
        if self.leader == Some(leader) {
            return Vec::new();
        }
        self.leader = Some(leader);
        vec![Output::Elected(leader)]
    }
}
