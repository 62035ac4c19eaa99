//! Proposer unit.
//!
//! Drives slots through Prepare/Promise and Accept/Ack. Majorities are
//! detected by the tally units, which report back on this unit's queue. A
//! round that does not complete within the phase timeout (plus jittered
//! backoff) restarts with a fresh, higher number; retries are unbounded.

use std::collections::BTreeMap;

use error_stack::Report;
use rand::rngs::StdRng;
use synod_core::{CodecError, PaxosMessage, ProposalNumber, Slot, SlotContext};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::acceptor::AcceptorSnapshot;
use crate::config::ProposerConfig;
use crate::core::{AckQuorum, AckTally, Ballots, PromiseQuorum, PromiseTally, ProposerCore};
use crate::log::CommittedLog;
use crate::store::StateStore;
use crate::tally::TallyRequest;
use crate::transport::{Outbox, Transport};

/// Restarts beyond this many are logged at `warn`.
const QUIET_RETRIES: u32 = 3;

/// A decided slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision<V> {
    pub slot: Slot,
    pub value: V,
}

/// Message to the proposer unit.
pub enum ProposerRequest<V> {
    /// Run a round for `slot` (the next free slot if `None`). The reply
    /// carries whatever value the slot ends up with, or an error if `value`
    /// is too large to ever leave this node.
    Propose {
        slot: Option<Slot>,
        value: V,
        reply: DecisionReply<V>,
    },
    Promised(PromiseQuorum<V>),
    Decided(AckQuorum<V>),
}

impl<V> From<PromiseQuorum<V>> for ProposerRequest<V> {
    fn from(quorum: PromiseQuorum<V>) -> Self {
        Self::Promised(quorum)
    }
}

impl<V> From<AckQuorum<V>> for ProposerRequest<V> {
    fn from(quorum: AckQuorum<V>) -> Self {
        Self::Decided(quorum)
    }
}

pub type DecisionReply<V> = oneshot::Sender<Result<Decision<V>, Report<CodecError>>>;

/// Introspection view of one in-flight round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundView {
    pub number: ProposalNumber,
    pub phase: &'static str,
    pub attempts: u32,
}

pub type ProposerSnapshot = BTreeMap<Slot, RoundView>;

/// Channels the proposer talks to.
pub struct ProposerLinks<V: Clone + Eq + Send + 'static> {
    pub promises: mpsc::Sender<TallyRequest<PromiseTally<V>>>,
    pub acks: mpsc::Sender<TallyRequest<AckTally<V>>>,
    pub log: watch::Receiver<CommittedLog<V>>,
    pub acceptor: watch::Receiver<AcceptorSnapshot<V>>,
    pub snapshot: watch::Sender<ProposerSnapshot>,
}

pub struct Proposer<V: Clone + Eq + Send + 'static, I, S, T> {
    core: ProposerCore<V>,
    store: S,
    outbox: Outbox<T, PaxosMessage<V, I>>,
    links: ProposerLinks<V>,
    config: ProposerConfig,
    rng: StdRng,
    deadlines: BTreeMap<Slot, Instant>,
    waiters: BTreeMap<Slot, Vec<DecisionReply<V>>>,
}

impl<V, I, S, T> Proposer<V, I, S, T>
where
    V: Clone + Eq + Default + std::fmt::Debug + serde::Serialize + Send + Sync + 'static,
    I: Clone + serde::Serialize + Send + Sync + 'static,
    S: StateStore<V>,
    T: Transport,
{
    pub fn new(
        ballots: Ballots,
        store: S,
        outbox: Outbox<T, PaxosMessage<V, I>>,
        links: ProposerLinks<V>,
        config: ProposerConfig,
    ) -> Self {
        let rng = config.rng();
        Self {
            core: ProposerCore::new(ballots),
            store,
            outbox,
            links,
            config,
            rng,
            deadlines: BTreeMap::new(),
            waiters: BTreeMap::new(),
        }
    }

    #[instrument(skip_all, name = "proposer", fields(node = %self.outbox.id()))]
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<ProposerRequest<V>>,
        cancel: CancellationToken,
    ) {
        debug!(next_round = self.core.ballots().next_round(), "proposer started");
        let mut ticker = tokio::time::interval(self.config.tally_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                request = requests.recv() => {
                    let Some(request) = request else { break };
                    self.handle(request).await;
                }

                changed = self.links.log.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.observe_commits().await;
                }

                _ = ticker.tick() => self.restart_expired().await,
            }
        }
        debug!("proposer stopped");
    }

    async fn handle(&mut self, request: ProposerRequest<V>) {
        match request {
            ProposerRequest::Propose { slot, value, reply } => {
                self.propose(slot, value, reply).await;
            }
            ProposerRequest::Promised(quorum) => self.on_promised(quorum).await,
            ProposerRequest::Decided(quorum) => self.on_decided(quorum).await,
        }
    }

    async fn propose(&mut self, slot: Option<Slot>, value: V, reply: DecisionReply<V>) {
        let (slot, committed) = {
            let log = self.links.log.borrow();
            let slot = slot.unwrap_or_else(|| self.core.free_slot(log.next_slot()));
            (slot, log.get(slot).cloned())
        };
        if let Some(value) = committed {
            let _ = reply.send(Ok(Decision { slot, value }));
            return;
        }

        // Accept is the largest message that carries the value.
        let accept = PaxosMessage::Accept {
            number: ProposalNumber(u64::MAX),
            slot,
            value: value.clone(),
        };
        if let Err(e) = self.outbox.fits(&accept) {
            warn!(%slot, error = ?e, "value does not fit in a datagram, refusing to propose");
            let _ = reply.send(Err(e.attach(SlotContext::new(slot))));
            return;
        }

        self.waiters.entry(slot).or_default().push(reply);
        if self.core.round(slot).is_some() {
            trace!(%slot, "joining round already in flight");
            return;
        }
        self.start(slot, value).await;
    }

    /// Start or restart the round for `slot`.
    async fn start(&mut self, slot: Slot, value: V) {
        let seen = self.links.acceptor.borrow().get(&slot).map(|state| {
            (state.max_prepare, state.accepted.as_ref().map(|a| a.number))
        });
        if let Some((max_prepare, accepted)) = seen {
            for number in max_prepare.into_iter().chain(accepted) {
                self.core.observe(number);
            }
        }

        let number = self.core.begin(slot, value);
        let Some(round) = self.core.round(slot) else {
            return;
        };
        let attempts = round.attempts;
        let default = round.value.clone();

        // The counter must be durable before the number is visible anywhere.
        if let Err(e) = self.store.save_round(self.core.ballots().next_round()).await {
            error!(%slot, %number, error = ?e, "failed to persist proposer round");
            self.arm(slot, attempts);
            return;
        }

        if attempts == 0 {
            debug!(%slot, %number, "starting round");
        } else if attempts <= QUIET_RETRIES {
            debug!(%slot, %number, attempts, "restarting round");
        } else {
            warn!(%slot, %number, attempts, "still no majority, restarting round");
        }

        let _ = self
            .links
            .promises
            .send(TallyRequest::Track {
                slot,
                number,
                value: default,
            })
            .await;
        self.arm(slot, attempts);
        self.outbox.broadcast(PaxosMessage::Prepare { number, slot }).await;
        self.publish();
    }

    async fn on_promised(&mut self, quorum: PromiseQuorum<V>) {
        let PromiseQuorum {
            slot,
            number,
            value,
            highest_accepted,
        } = quorum;
        if let Some(seen) = highest_accepted {
            self.core.observe(seen);
        }
        if !self.core.promised(slot, number, value.clone()) {
            trace!(%slot, %number, "ignoring promise quorum for superseded round");
            return;
        }
        let attempts = self.core.round(slot).map_or(0, |r| r.attempts);
        debug!(%slot, %number, "promise majority, sending accept");

        let _ = self
            .links
            .acks
            .send(TallyRequest::Track {
                slot,
                number,
                value: value.clone(),
            })
            .await;
        self.arm(slot, attempts);
        self.outbox
            .broadcast(PaxosMessage::Accept {
                number,
                slot,
                value,
            })
            .await;
        self.publish();
    }

    async fn on_decided(&mut self, quorum: AckQuorum<V>) {
        let AckQuorum {
            slot,
            number,
            value,
        } = quorum;
        if self.core.decided(slot, number).is_none() {
            trace!(%slot, %number, "ignoring ack quorum for superseded round");
            return;
        }
        info!(%slot, %number, "slot decided");
        self.deadlines.remove(&slot);
        self.resolve(slot, &value);
        self.outbox
            .broadcast(PaxosMessage::Commit { slot, value })
            .await;
        self.publish();
    }

    /// Drop rounds for slots that were committed, by us or anyone else.
    async fn observe_commits(&mut self) {
        let committed: Vec<(Slot, V)> = {
            let log = self.links.log.borrow_and_update();
            self.waiters
                .keys()
                .chain(self.core.rounds().keys())
                .filter_map(|slot| log.get(*slot).map(|v| (*slot, v.clone())))
                .collect()
        };
        if committed.is_empty() {
            return;
        }
        for (slot, value) in committed {
            if self.core.committed(slot).is_some() {
                debug!(%slot, "slot committed elsewhere, dropping round");
                let _ = self.links.promises.send(TallyRequest::Forget { slot }).await;
                let _ = self.links.acks.send(TallyRequest::Forget { slot }).await;
            }
            self.deadlines.remove(&slot);
            self.resolve(slot, &value);
        }
        self.publish();
    }

    async fn restart_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<Slot> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in expired {
            if self.links.log.borrow().contains(slot) {
                // The log watch will resolve it.
                continue;
            }
            let Some(value) = self.core.round(slot).map(|r| r.value.clone()) else {
                self.deadlines.remove(&slot);
                continue;
            };
            self.start(slot, value).await;
        }
    }

    fn arm(&mut self, slot: Slot, attempts: u32) {
        let delay = self.config.phase_timeout + self.config.backoff.duration(attempts, &mut self.rng);
        self.deadlines.insert(slot, Instant::now() + delay);
    }

    fn resolve(&mut self, slot: Slot, value: &V) {
        for waiter in self.waiters.remove(&slot).unwrap_or_default() {
            let _ = waiter.send(Ok(Decision {
                slot,
                value: value.clone(),
            }));
        }
    }

    fn publish(&self) {
        let snapshot = self
            .core
            .rounds()
            .iter()
            .map(|(slot, round)| {
                (
                    *slot,
                    RoundView {
                        number: round.number,
                        phase: round.phase.name(),
                        attempts: round.attempts,
                    },
                )
            })
            .collect();
        self.links.snapshot.send_replace(snapshot);
    }
}
