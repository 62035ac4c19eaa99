//! Acceptor unit.
//!
//! Owns the per-slot [`AcceptorCore`] and the [`CommittedLog`]. Every state
//! change is written to the store before the reply that depends on it goes
//! out; if the write fails the reply is withheld.
//!
//! The log lives in its watch channel and both snapshots are edited in place,
//! so a message costs the same however long the history gets. A slot's
//! promise and accepted pair are dropped once the slot commits.
//!
//! Commits are single datagrams and can be lost. Every `sync_interval` the
//! acceptor asks its peers for the slots it is missing; peers answer with
//! `Commit`s from their own logs.

use std::collections::BTreeMap;

use synod_core::{Envelope, NodeId, PaxosMessage, ProposalNumber, Slot};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use crate::config::AcceptorConfig;
use crate::core::{AcceptResult, AcceptorCore, PrepareResult, SlotState};
use crate::log::{CommittedLog, Recorded};
use crate::store::StateStore;
use crate::transport::{Outbox, Transport};

/// Snapshot of every slot this acceptor knows about.
pub type AcceptorSnapshot<V> = BTreeMap<Slot, SlotState<V>>;

pub struct Acceptor<V, I, S, T> {
    core: AcceptorCore<V>,
    store: S,
    outbox: Outbox<T, PaxosMessage<V, I>>,
    log_tx: watch::Sender<CommittedLog<V>>,
    state_tx: watch::Sender<AcceptorSnapshot<V>>,
    config: AcceptorConfig,
}

impl<V, I, S, T> Acceptor<V, I, S, T>
where
    V: Clone + Eq + Default + std::fmt::Debug + serde::Serialize + Send + Sync + 'static,
    I: Clone + serde::Serialize + Send + Sync + 'static,
    S: StateStore<V>,
    T: Transport,
{
    /// Build from recovered state. The published snapshots start out equal
    /// to what was loaded.
    pub fn new(
        mut slots: BTreeMap<Slot, SlotState<V>>,
        log: BTreeMap<Slot, V>,
        store: S,
        outbox: Outbox<T, PaxosMessage<V, I>>,
        log_tx: watch::Sender<CommittedLog<V>>,
        state_tx: watch::Sender<AcceptorSnapshot<V>>,
        config: AcceptorConfig,
    ) -> Self {
        slots.retain(|slot, _| !log.contains_key(slot));
        let core = AcceptorCore::from_slots(slots);
        log_tx.send_replace(CommittedLog::from_entries(log));
        state_tx.send_replace(core.slots().clone());
        Self {
            core,
            store,
            outbox,
            log_tx,
            state_tx,
            config,
        }
    }

    #[instrument(skip_all, name = "acceptor", fields(node = %self.outbox.id()))]
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Envelope<PaxosMessage<V, I>>>,
        cancel: CancellationToken,
    ) {
        debug!(
            slots = self.core.slots().len(),
            committed = self.log_tx.borrow().len(),
            "acceptor started"
        );
        let period = self.config.sync_interval;
        let mut sync = tokio::time::interval_at(Instant::now() + period, period);
        sync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                msg = inbox.recv() => {
                    let Some(Envelope { from, body }) = msg else { break };
                    self.handle(from, body).await;
                }

                _ = sync.tick() => self.request_sync().await,
            }
        }
        debug!("acceptor stopped");
    }

    async fn handle(&mut self, from: NodeId, body: PaxosMessage<V, I>) {
        match body {
            PaxosMessage::Prepare { number, slot } => self.on_prepare(from, number, slot).await,
            PaxosMessage::Accept {
                number,
                slot,
                value,
            } => self.on_accept(from, number, slot, value).await,
            PaxosMessage::Commit { slot, value } => self.on_commit(from, slot, value).await,
            PaxosMessage::Sync { next, missing } => self.on_sync(from, next, &missing).await,
            other => trace!(kind = other.kind(), "not an acceptor message"),
        }
    }

    fn committed(&self, slot: Slot) -> Option<V> {
        self.log_tx.borrow().get(slot).cloned()
    }

    async fn on_prepare(&mut self, from: NodeId, number: ProposalNumber, slot: Slot) {
        if let Some(value) = self.committed(slot) {
            trace!(%from, %slot, "prepare for committed slot, replying with commit");
            self.outbox.send(from, PaxosMessage::Commit { slot, value }).await;
            return;
        }

        match self.core.prepare(slot, number) {
            PrepareResult::Promised { accepted } => {
                if !self.persist(slot).await {
                    return;
                }
                trace!(%from, %slot, %number, "promised");
                self.outbox
                    .send(
                        from,
                        PaxosMessage::Promise {
                            number,
                            slot,
                            accepted,
                        },
                    )
                    .await;
            }
            PrepareResult::Rejected { promised } => {
                trace!(%from, %slot, %number, %promised, "ignoring stale prepare");
            }
        }
    }

    async fn on_accept(&mut self, from: NodeId, number: ProposalNumber, slot: Slot, value: V) {
        if let Some(value) = self.committed(slot) {
            trace!(%from, %slot, "accept for committed slot, replying with commit");
            self.outbox.send(from, PaxosMessage::Commit { slot, value }).await;
            return;
        }

        match self.core.accept(slot, number, value.clone()) {
            AcceptResult::Accepted => {
                if !self.persist(slot).await {
                    return;
                }
                trace!(%from, %slot, %number, "accepted");
                self.outbox
                    .send(
                        from,
                        PaxosMessage::Ack {
                            number,
                            slot,
                            value,
                        },
                    )
                    .await;
            }
            AcceptResult::Rejected { promised } => {
                trace!(%from, %slot, %number, %promised, "ignoring stale accept");
            }
        }
    }

    async fn on_commit(&mut self, from: NodeId, slot: Slot, value: V) {
        match self.committed(slot) {
            Some(existing) if existing == value => {
                trace!(%from, %slot, "duplicate commit");
                return;
            }
            Some(existing) => {
                error!(
                    %from, %slot, ?existing, conflicting = ?value,
                    "conflicting commit for decided slot, ignoring"
                );
                return;
            }
            None => {}
        }

        if let Err(e) = self.store.save_commit(slot, &value).await {
            error!(%slot, error = ?e, "failed to persist commit");
            return;
        }
        self.log_tx.send_if_modified(|log| log.record(slot, value) == Recorded::New);
        info!(%from, %slot, "slot committed");
        if self.core.forget(slot).is_some() {
            self.state_tx.send_modify(|slots| {
                slots.remove(&slot);
            });
        }
    }

    async fn request_sync(&self) {
        let (next, missing) = {
            let log = self.log_tx.borrow();
            let missing: Vec<Slot> = log.gaps().take(self.config.sync_batch).collect();
            (log.next_slot(), missing)
        };
        let id = self.outbox.id();
        let peers: Vec<NodeId> = self.outbox.cluster().ids().filter(|peer| *peer != id).collect();
        trace!(%next, missing = missing.len(), "asking peers for missed commits");
        for peer in peers {
            self.outbox
                .send(
                    peer,
                    PaxosMessage::Sync {
                        next,
                        missing: missing.clone(),
                    },
                )
                .await;
        }
    }

    async fn on_sync(&self, from: NodeId, next: Slot, missing: &[Slot]) {
        let commits: Vec<(Slot, V)> = {
            let log = self.log_tx.borrow();
            missing
                .iter()
                .filter_map(|slot| log.get(*slot).map(|value| (*slot, value.clone())))
                .chain(log.since(next).map(|(slot, value)| (slot, value.clone())))
                .take(self.config.sync_batch)
                .collect()
        };
        if commits.is_empty() {
            return;
        }
        debug!(%from, count = commits.len(), "sending missed commits");
        for (slot, value) in commits {
            self.outbox.send(from, PaxosMessage::Commit { slot, value }).await;
        }
    }

    /// Write the slot's state; `false` if the reply must be withheld.
    async fn persist(&mut self, slot: Slot) -> bool {
        let Some(state) = self.core.get(slot) else {
            return false;
        };
        if let Err(e) = self.store.save_slot(slot, state).await {
            error!(%slot, error = ?e, "failed to persist acceptor state, withholding reply");
            return false;
        }
        let state = state.clone();
        self.state_tx.send_modify(|slots| {
            slots.insert(slot, state);
        });
        true
    }
}
