//! Stateright model checker tests for per-slot Synod
//!
//! Each model actor is a full node: the same `AcceptorCore`, `ProposerCore`
//! and tallies the async units run, wired together synchronously. Retries are
//! modelled as a self-addressed message so the checker explores every restart
//! timing.
//!
//! Lossless networks are explored exhaustively. The lossy duplicating network
//! blows up the state space (every subset of in-flight messages is a distinct
//! state), so that configuration is explored only to a fixed depth.

use std::borrow::Cow;
use std::sync::Arc;

use stateright::actor::{Actor, ActorModel, Id, LossyNetwork, Network, Out};
use stateright::{Checker, Expectation, Model};
use synod_core::{Accepted, NodeId, ProposalNumber, Slot};
use synod_paxos::core::{
    AcceptResult, AcceptorCore, AckTally, Ballots, PrepareResult, PromiseTally, ProposerCore, Tally,
};

/// Value type (simplified to an integer for model checking)
type Value = u8;

const SLOT: Slot = Slot(0);

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum Msg {
    Prepare {
        number: ProposalNumber,
    },
    Promise {
        number: ProposalNumber,
        accepted: Option<Accepted<Value>>,
    },
    Accept {
        number: ProposalNumber,
        value: Value,
    },
    Ack {
        number: ProposalNumber,
        value: Value,
    },
    Commit {
        value: Value,
    },
    /// Restart the round (stands in for the phase timeout).
    Retry,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct NodeState {
    acceptor: AcceptorCore<Value>,
    proposer: ProposerCore<Value>,
    promises: PromiseTally<Value>,
    acks: AckTally<Value>,
    /// Value this node's own proposer saw decided.
    decided: Option<Value>,
    /// Value this node recorded from a Commit.
    learned: Option<Value>,
}

#[derive(Clone, Debug)]
struct NodeActor {
    rank: u32,
    peers: Vec<Id>,
    proposes: Option<Value>,
}

fn node_id(id: Id) -> NodeId {
    NodeId(u32::try_from(usize::from(id)).unwrap())
}

impl NodeActor {
    fn cluster_size(&self) -> u32 {
        u32::try_from(self.peers.len()).unwrap()
    }

    fn broadcast(&self, o: &mut Out<Self>, msg: &Msg) {
        for &peer in &self.peers {
            o.send(peer, msg.clone());
        }
    }

    fn start_round(&self, id: Id, state: &mut NodeState, value: Value, o: &mut Out<Self>) {
        let number = state.proposer.begin(SLOT, value);
        let default = state.proposer.round(SLOT).map_or(value, |r| r.value);
        state.promises.track(SLOT, number, default);
        self.broadcast(o, &Msg::Prepare { number });
        o.send(id, Msg::Retry);
    }
}

impl Actor for NodeActor {
    type Msg = Msg;
    type State = NodeState;
    type Timer = ();

    fn on_start(&self, id: Id, o: &mut Out<Self>) -> Self::State {
        let n = self.peers.len();
        let mut state = NodeState {
            acceptor: AcceptorCore::new(),
            proposer: ProposerCore::new(Ballots::new(self.rank, self.cluster_size(), 0)),
            promises: PromiseTally::new(n),
            acks: AckTally::new(n),
            decided: None,
            learned: None,
        };
        if let Some(value) = self.proposes {
            self.start_round(id, &mut state, value, o);
        }
        state
    }

    fn on_msg(
        &self,
        id: Id,
        state: &mut Cow<Self::State>,
        src: Id,
        msg: Self::Msg,
        o: &mut Out<Self>,
    ) {
        match msg {
            Msg::Prepare { number } => {
                if let PrepareResult::Promised { accepted } =
                    state.to_mut().acceptor.prepare(SLOT, number)
                {
                    o.send(src, Msg::Promise { number, accepted });
                }
            }
            Msg::Accept { number, value } => {
                if state.to_mut().acceptor.accept(SLOT, number, value) == AcceptResult::Accepted {
                    o.send(src, Msg::Ack { number, value });
                }
            }
            Msg::Promise { number, accepted } => {
                let state = state.to_mut();
                if let Some(seen) = accepted.as_ref().map(|a| a.number) {
                    state.proposer.observe(seen);
                }
                state.promises.record(node_id(src), SLOT, number, accepted);
                for quorum in state.promises.scan() {
                    if state
                        .proposer
                        .promised(quorum.slot, quorum.number, quorum.value)
                    {
                        state.acks.track(quorum.slot, quorum.number, quorum.value);
                        self.broadcast(
                            o,
                            &Msg::Accept {
                                number: quorum.number,
                                value: quorum.value,
                            },
                        );
                    }
                }
            }
            Msg::Ack { number, value } => {
                let state = state.to_mut();
                state.acks.record(node_id(src), SLOT, number, value);
                for quorum in state.acks.scan() {
                    if state.proposer.decided(quorum.slot, quorum.number).is_some() {
                        state.decided = Some(quorum.value);
                        self.broadcast(
                            o,
                            &Msg::Commit {
                                value: quorum.value,
                            },
                        );
                    }
                }
            }
            Msg::Commit { value } => {
                if state.learned.is_none() {
                    state.to_mut().learned = Some(value);
                }
            }
            Msg::Retry => {
                if state.decided.is_some() || state.learned.is_some() {
                    return;
                }
                let Some(value) = state.proposer.round(SLOT).map(|r| r.value) else {
                    return;
                };
                self.start_round(id, state.to_mut(), value, o);
            }
        }
    }
}

#[derive(Clone)]
struct ModelConfig {
    max_round: u64,
}

fn synod_model(
    nodes: usize,
    values: &[Value],
    max_round: u64,
    network: Network<Msg>,
    lossy: LossyNetwork,
) -> ActorModel<NodeActor, ModelConfig, ()> {
    let peers: Vec<Id> = (0..nodes).map(Id::from).collect();

    let mut model = ActorModel::new(ModelConfig { max_round }, ())
        .init_network(network)
        .lossy_network(lossy)
        // Bound state space: don't explore states with too many restarts
        .within_boundary(|cfg, state| {
            state
                .actor_states
                .iter()
                .all(|s: &Arc<NodeState>| s.proposer.ballots().next_round() <= cfg.max_round)
        });

    for rank in 0..nodes {
        model = model.actor(NodeActor {
            rank: u32::try_from(rank).unwrap(),
            peers: peers.clone(),
            proposes: values.get(rank).copied(),
        });
    }

    // Agreement: every decided or learned value is the same.
    model
        .property(Expectation::Always, "Agreement", |_, state| {
            let mut seen = state
                .actor_states
                .iter()
                .flat_map(|s| [s.decided, s.learned])
                .flatten();
            match seen.next() {
                Some(first) => seen.all(|v| v == first),
                None => true,
            }
        })
        .property(Expectation::Sometimes, "Decided", |_, state| {
            state.actor_states.iter().any(|s| s.decided.is_some())
        })
        // Accepted numbers never exceed promises.
        .property(Expectation::Always, "AcceptedWithinPromise", |_, state| {
            state.actor_states.iter().all(|s| match s.acceptor.get(SLOT) {
                Some(slot) => match (&slot.accepted, slot.max_prepare) {
                    (Some(accepted), Some(promised)) => accepted.number <= promised,
                    (Some(_), None) => false,
                    (None, _) => true,
                },
                None => true,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_single_proposer() {
        // 1 proposer, 3 nodes, one retry allowed
        let model = synod_model(
            3,
            &[1],
            2,
            Network::new_unordered_nonduplicating([]),
            LossyNetwork::No,
        );

        let checker = model.checker().threads(num_cpus::get()).spawn_bfs().join();

        checker.assert_properties();
        println!(
            "Single proposer: {} states explored",
            checker.unique_state_count()
        );
    }

    #[test]
    fn check_competing_proposers() {
        // 2 proposers with different values, 3 nodes, no retries
        let model = synod_model(
            3,
            &[1, 2],
            1,
            Network::new_unordered_nonduplicating([]),
            LossyNetwork::No,
        );

        let checker = model.checker().threads(num_cpus::get()).spawn_bfs().join();

        checker.assert_properties();
        println!(
            "Competing proposers: {} states explored",
            checker.unique_state_count()
        );
    }

    #[test]
    fn check_competing_proposers_with_retries() {
        // Restarts let each proposer outbid the other once. Per-link FIFO
        // delivery keeps the restart interleavings tractable.
        let model = synod_model(3, &[1, 2], 2, Network::new_ordered([]), LossyNetwork::No);

        let checker = model
            .checker()
            .threads(num_cpus::get())
            .target_max_depth(24)
            .spawn_bfs()
            .join();

        checker.assert_properties();
        println!(
            "Competing proposers with retries: {} states explored",
            checker.unique_state_count()
        );
    }

    #[test]
    fn check_lossy_duplicating_network() {
        // Drops, duplicates and reordering together, 2 proposers, no retries
        let model = synod_model(
            3,
            &[1, 2],
            1,
            Network::new_unordered_duplicating([]),
            LossyNetwork::Yes,
        );

        let checker = model
            .checker()
            .threads(num_cpus::get())
            .target_max_depth(10)
            .spawn_bfs()
            .join();

        checker.assert_no_discovery("Agreement");
        checker.assert_no_discovery("AcceptedWithinPromise");
        println!(
            "Lossy duplicating network: {} states explored",
            checker.unique_state_count()
        );
    }
}
