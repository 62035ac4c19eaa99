//! Intent driver.
//!
//! Turns client insert/delete intents into proposals, one at a time and in
//! arrival order. Local intents go to the leader; intents forwarded to this
//! node run here whatever its role, so an intent is forwarded at most once.

use std::time::Duration;

use error_stack::{Report, ResultExt};
use synod_core::{Intent, NodeError, NodeId, OperationContext, PaxosMessage, Replicated, Slot};
use synod_paxos::transport::{Outbox, Transport};
use synod_paxos::{CommittedLog, ProposerRequest};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Where a submitted intent ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntentOutcome {
    /// Committed by this node at `slot`.
    Committed { slot: Slot },
    /// Handed to `leader`; its result is not reported back.
    Forwarded { leader: NodeId },
}

pub(crate) struct IntentRequest<I> {
    pub(crate) intent: Intent<I>,
    pub(crate) reply: oneshot::Sender<Result<IntentOutcome, Report<NodeError>>>,
}

pub(crate) struct IntentDriver<V: Replicated, T> {
    id: NodeId,
    outbox: Outbox<T, PaxosMessage<V, V::Item>>,
    proposer: mpsc::Sender<ProposerRequest<V>>,
    log: watch::Receiver<CommittedLog<V>>,
    leader: watch::Receiver<Option<NodeId>>,
    /// How long to wait for a lost slot to show up in the local log.
    settle: Duration,
}

impl<V: Replicated, T: Transport> IntentDriver<V, T> {
    pub(crate) fn new(
        outbox: Outbox<T, PaxosMessage<V, V::Item>>,
        proposer: mpsc::Sender<ProposerRequest<V>>,
        log: watch::Receiver<CommittedLog<V>>,
        leader: watch::Receiver<Option<NodeId>>,
        settle: Duration,
    ) -> Self {
        Self {
            id: outbox.id(),
            outbox,
            proposer,
            log,
            leader,
            settle,
        }
    }

    #[instrument(skip_all, name = "intents", fields(node = %self.id))]
    pub(crate) async fn run(
        mut self,
        mut local: mpsc::Receiver<IntentRequest<V::Item>>,
        mut forwarded: mpsc::Receiver<(NodeId, Intent<V::Item>)>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                request = local.recv() => {
                    let Some(IntentRequest { intent, reply }) = request else { break };
                    let outcome = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        outcome = self.submit(intent) => outcome,
                    };
                    let _ = reply.send(outcome);
                }

                request = forwarded.recv() => {
                    let Some((from, intent)) = request else { break };
                    debug!(%from, ?intent, "executing forwarded intent");
                    let result = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        result = self.execute(&intent) => result,
                    };
                    match result {
                        Ok(slot) => info!(%from, %slot, "forwarded intent committed"),
                        Err(e) => warn!(%from, ?intent, error = ?e, "forwarded intent failed"),
                    }
                }
            }
        }
        debug!("intent driver stopped");
    }

    async fn submit(&mut self, intent: Intent<V::Item>) -> Result<IntentOutcome, Report<NodeError>> {
        let leader = self.await_leader().await?;
        if leader != self.id {
            debug!(%leader, ?intent, "forwarding intent to leader");
            self.outbox.send(leader, PaxosMessage::Forward(intent)).await;
            return Ok(IntentOutcome::Forwarded { leader });
        }
        let slot = self.execute(&intent).await?;
        Ok(IntentOutcome::Committed { slot })
    }

    async fn await_leader(&mut self) -> Result<NodeId, Report<NodeError>> {
        let leader = self
            .leader
            .wait_for(Option::is_some)
            .await
            .map(|leader| *leader)
            .change_context(NodeError)
            .attach(OperationContext::FORWARDING)?;
        leader.ok_or_else(|| Report::new(NodeError).attach("elector stopped"))
    }

    /// Apply `intent` on top of the current value and commit the result at
    /// the next free slot, starting over whenever another value takes it.
    async fn execute(&mut self, intent: &Intent<V::Item>) -> Result<Slot, Report<NodeError>> {
        loop {
            let (slot, base) = {
                let log = self.log.borrow();
                (log.next_slot(), log.current_value())
            };
            let next = base
                .apply(intent)
                .change_context(NodeError)
                .attach(OperationContext::APPLYING_INTENT)?;

            let (reply, decided) = oneshot::channel();
            self.proposer
                .send(ProposerRequest::Propose {
                    slot: Some(slot),
                    value: next.clone(),
                    reply,
                })
                .await
                .map_err(|_| Report::new(NodeError).attach("proposer stopped"))?;
            let decision = decided
                .await
                .change_context(NodeError)
                .attach(OperationContext::PROPOSING)?
                .change_context(NodeError)
                .attach(OperationContext::PROPOSING)?;

            if decision.value == next {
                return Ok(decision.slot);
            }
            debug!(%slot, "slot taken by another value, retrying on top of it");
            // If the commit never reaches us, the next proposal for this
            // slot learns it from the acceptors.
            let _ = tokio::time::timeout(self.settle, self.log.wait_for(|log| log.contains(slot))).await;
        }
    }
}
