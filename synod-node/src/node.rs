//! A cluster member: one task per unit, wired together by queues.
//!
//! ```text
//!   data port ──► Inbox ──► Router ─┬─► Acceptor ──► log watch ──┐
//!                                   ├─► promise tally ─┐         │
//!                                   ├─► ack tally ─────┼─► Proposer
//!                                   └─► intent driver ─┘
//!   control port ──► Inbox ──► Elector ──► leader watch
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use synod_core::{
    ClusterTable, ElectionMessage, Intent, NodeContext, NodeError, NodeId, OperationContext,
    PaxosMessage, Replicated,
};
use synod_paxos::core::{AckTally, Ballots, ElectionState, PromiseTally};
use synod_paxos::transport::{Inbox, Outbox, Port, Transport};
use synod_paxos::{
    Acceptor, AcceptorConfig, AcceptorSnapshot, CommittedLog, Decision, ElectionConfig, Elector, Proposer,
    ProposerConfig, ProposerLinks, ProposerRequest, ProposerSnapshot, Router, StateStore,
    TallyUnit,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{IntentDriver, IntentOutcome, IntentRequest};

/// Everything a node needs besides its store and sockets.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    pub cluster: Arc<ClusterTable>,
    pub proposer: ProposerConfig,
    pub election: ElectionConfig,
    pub acceptor: AcceptorConfig,
    /// Capacity of every unit's queue.
    pub queue_capacity: usize,
    /// Require previously persisted state (and refuse to start without it).
    /// When unset, finding persisted state is an error instead.
    pub resume: bool,
}

impl NodeConfig {
    #[must_use]
    pub fn new(id: NodeId, cluster: Arc<ClusterTable>) -> Self {
        Self {
            id,
            cluster,
            proposer: ProposerConfig::default(),
            election: ElectionConfig::default(),
            acceptor: AcceptorConfig::default(),
            queue_capacity: 1024,
            resume: false,
        }
    }

    #[must_use]
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// Handle to a running node.
pub struct Node<V: Replicated, S> {
    id: NodeId,
    store: S,
    proposer: mpsc::Sender<ProposerRequest<V>>,
    intents: mpsc::Sender<IntentRequest<V::Item>>,
    log: watch::Receiver<CommittedLog<V>>,
    leader: watch::Receiver<Option<NodeId>>,
    election: watch::Receiver<ElectionState>,
    acceptor_state: watch::Receiver<AcceptorSnapshot<V>>,
    proposer_state: watch::Receiver<ProposerSnapshot>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<V, S> Node<V, S>
where
    V: Replicated,
    S: StateStore<V>,
{
    /// Recover persisted state and spawn every unit.
    ///
    /// `data` and `control` must already be bound to this node's ports from
    /// the cluster table.
    pub async fn start<T: Transport>(
        config: NodeConfig,
        store: S,
        data: Arc<T>,
        control: Arc<T>,
    ) -> Result<Self, Report<NodeError>> {
        let NodeConfig {
            id,
            cluster,
            proposer: proposer_config,
            election: election_config,
            acceptor: acceptor_config,
            queue_capacity,
            resume,
        } = config;

        let persisted = store
            .load()
            .await
            .change_context(NodeError)
            .attach(OperationContext::LOADING_STATE)
            .attach(NodeContext::new(id))?;
        if resume && persisted.is_empty() {
            return Err(Report::new(NodeError)
                .attach(NodeContext::new(id))
                .attach("resume requested but no persisted state was found"));
        }
        if !resume && !persisted.is_empty() {
            return Err(Report::new(NodeError)
                .attach(NodeContext::new(id))
                .attach("persisted state exists; start with resume to reuse it"));
        }
        if let Some(stored) = persisted.node_id
            && stored != id
        {
            return Err(Report::new(NodeError)
                .attach(NodeContext::new(id))
                .attach(format!("persisted state belongs to {stored}")));
        }
        let rank = cluster.rank(id).ok_or_else(|| {
            Report::new(NodeError)
                .attach(NodeContext::new(id))
                .attach("node is not in the cluster table")
        })?;
        let size = cluster.len();

        info!(
            %id,
            rank,
            cluster = size,
            committed = persisted.log.len(),
            next_round = persisted.next_round,
            "starting node"
        );

        let cancel = CancellationToken::new();

        let (loopback_tx, loopback_rx) = mpsc::channel(queue_capacity);
        let (acceptor_tx, acceptor_rx) = mpsc::channel(queue_capacity);
        let (promises_tx, promises_rx) = mpsc::channel(queue_capacity);
        let (acks_tx, acks_rx) = mpsc::channel(queue_capacity);
        let (forwarded_tx, forwarded_rx) = mpsc::channel(queue_capacity);
        let (proposer_tx, proposer_rx) = mpsc::channel(queue_capacity);
        let (intents_tx, intents_rx) = mpsc::channel(queue_capacity);
        let (election_tx, election_rx) = mpsc::channel(queue_capacity);

        let (log_tx, log_rx) = watch::channel(CommittedLog::new());
        let (acceptor_state_tx, acceptor_state_rx) = watch::channel(BTreeMap::new());
        let (proposer_state_tx, proposer_state_rx) = watch::channel(BTreeMap::new());
        let (leader_tx, leader_rx) = watch::channel(None);
        let (election_state_tx, election_state_rx) = watch::channel(ElectionState::Idle);

        let data_outbox: Outbox<T, PaxosMessage<V, V::Item>> =
            Outbox::new(id, cluster.clone(), data.clone(), Port::Data).with_loopback(loopback_tx);
        let control_outbox: Outbox<T, ElectionMessage> =
            Outbox::new(id, cluster.clone(), control.clone(), Port::Control);

        let acceptor = Acceptor::new(
            persisted.slots,
            persisted.log,
            store.clone(),
            data_outbox.clone(),
            log_tx,
            acceptor_state_tx,
            acceptor_config,
        );
        let proposer = Proposer::new(
            Ballots::new(rank, size, persisted.next_round),
            store.clone(),
            data_outbox.clone(),
            ProposerLinks {
                promises: promises_tx.clone(),
                acks: acks_tx.clone(),
                log: log_rx.clone(),
                acceptor: acceptor_state_rx.clone(),
                snapshot: proposer_state_tx,
            },
            proposer_config.clone(),
        );
        let promise_tally = TallyUnit::new(
            "promise",
            PromiseTally::new(size as usize),
            proposer_config.tally_interval,
        );
        let ack_tally = TallyUnit::new(
            "ack",
            AckTally::new(size as usize),
            proposer_config.tally_interval,
        );
        let elector = Elector::new(control_outbox, leader_tx, election_state_tx, election_config);
        let driver = IntentDriver::new(
            data_outbox,
            proposer_tx.clone(),
            log_rx.clone(),
            leader_rx.clone(),
            proposer_config.phase_timeout,
        );
        let router = Router {
            acceptor: acceptor_tx,
            promises: promises_tx,
            acks: acks_tx,
            forwarded: forwarded_tx,
        };
        let data_inbox = Inbox::new(data, cluster.clone()).with_loopback(loopback_rx);
        let control_inbox: Inbox<T, ElectionMessage> = Inbox::new(control, cluster);

        let tasks = vec![
            tokio::spawn(acceptor.run(acceptor_rx, cancel.clone())),
            tokio::spawn(proposer.run(proposer_rx, cancel.clone())),
            tokio::spawn(promise_tally.run(promises_rx, proposer_tx.clone(), cancel.clone())),
            tokio::spawn(ack_tally.run(acks_rx, proposer_tx.clone(), cancel.clone())),
            tokio::spawn(elector.run(election_rx, cancel.clone())),
            tokio::spawn(driver.run(intents_rx, forwarded_rx, cancel.clone())),
            tokio::spawn(data_inbox.run(cancel.clone(), move |envelope| router.route(envelope))),
            tokio::spawn(control_inbox.run(cancel.clone(), move |envelope| {
                if election_tx.try_send(envelope).is_err() {
                    warn!("election queue full, dropping message");
                }
            })),
        ];

        Ok(Self {
            id,
            store,
            proposer: proposer_tx,
            intents: intents_tx,
            log: log_rx,
            leader: leader_rx,
            election: election_state_rx,
            acceptor_state: acceptor_state_rx,
            proposer_state: proposer_state_rx,
            cancel,
            tasks,
        })
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Run a round for `value` at the next free slot. Resolves with whatever
    /// the slot ends up holding, which may be another node's value.
    pub async fn propose(&self, value: V) -> Result<Decision<V>, Report<NodeError>> {
        let (reply, decided) = oneshot::channel();
        self.proposer
            .send(ProposerRequest::Propose {
                slot: None,
                value,
                reply,
            })
            .await
            .map_err(|_| Report::new(NodeError).attach("proposer stopped"))?;
        decided
            .await
            .change_context(NodeError)
            .attach(OperationContext::PROPOSING)
            .attach(NodeContext::new(self.id))?
            .change_context(NodeError)
            .attach(OperationContext::PROPOSING)
            .attach(NodeContext::new(self.id))
    }

    pub async fn insert(&self, item: V::Item) -> Result<IntentOutcome, Report<NodeError>> {
        self.submit(Intent::Insert(item)).await
    }

    pub async fn delete(&self, item: V::Item) -> Result<IntentOutcome, Report<NodeError>> {
        self.submit(Intent::Delete(item)).await
    }

    /// Queue an intent behind any earlier ones. Waits for a leader if none
    /// is known yet.
    pub async fn submit(&self, intent: Intent<V::Item>) -> Result<IntentOutcome, Report<NodeError>> {
        let (reply, outcome) = oneshot::channel();
        self.intents
            .send(IntentRequest { intent, reply })
            .await
            .map_err(|_| Report::new(NodeError).attach("intent driver stopped"))?;
        outcome
            .await
            .change_context(NodeError)
            .attach(NodeContext::new(self.id))?
    }

    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        *self.leader.borrow()
    }

    #[must_use]
    pub fn election_state(&self) -> ElectionState {
        *self.election.borrow()
    }

    #[must_use]
    pub fn log(&self) -> CommittedLog<V> {
        self.log.borrow().clone()
    }

    /// Value at the highest committed slot.
    #[must_use]
    pub fn current_value(&self) -> V {
        self.log.borrow().current_value()
    }

    #[must_use]
    pub fn acceptor_state(&self) -> AcceptorSnapshot<V> {
        self.acceptor_state.borrow().clone()
    }

    #[must_use]
    pub fn proposer_state(&self) -> ProposerSnapshot {
        self.proposer_state.borrow().clone()
    }

    #[must_use]
    pub fn watch_log(&self) -> watch::Receiver<CommittedLog<V>> {
        self.log.clone()
    }

    #[must_use]
    pub fn watch_leader(&self) -> watch::Receiver<Option<NodeId>> {
        self.leader.clone()
    }

    /// Stop every unit, then record the node identity and sync the store.
    pub async fn shutdown(self) -> Result<(), Report<NodeError>> {
        debug!(id = %self.id, "shutting down");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "unit task failed");
            }
        }
        self.store
            .flush(self.id)
            .await
            .change_context(NodeError)
            .attach(NodeContext::new(self.id))
    }
}
