//! Leader election unit.
//!
//! Runs [`BullyCore`] over the control port. A round starts at startup and
//! then every `poll_interval`; the elected leader is published on a watch
//! channel and nowhere else.

use synod_core::{ElectionMessage, Envelope, NodeId};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use crate::config::ElectionConfig;
use crate::core::{BullyCore, ElectionState, Output};
use crate::transport::{Outbox, Transport};

pub struct Elector<T> {
    core: BullyCore,
    outbox: Outbox<T, ElectionMessage>,
    leader_tx: watch::Sender<Option<NodeId>>,
    state_tx: watch::Sender<ElectionState>,
    config: ElectionConfig,
    deadline: Option<Instant>,
}

impl<T: Transport> Elector<T> {
    pub fn new(
        outbox: Outbox<T, ElectionMessage>,
        leader_tx: watch::Sender<Option<NodeId>>,
        state_tx: watch::Sender<ElectionState>,
        config: ElectionConfig,
    ) -> Self {
        let core = BullyCore::new(outbox.id(), outbox.cluster());
        Self {
            core,
            outbox,
            leader_tx,
            state_tx,
            config,
            deadline: None,
        }
    }

    #[instrument(skip_all, name = "elector", fields(node = %self.outbox.id()))]
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Envelope<ElectionMessage>>,
        cancel: CancellationToken,
    ) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let timer = self.deadline.unwrap_or_else(Instant::now);
            let outputs = tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                msg = inbox.recv() => {
                    let Some(Envelope { from, body }) = msg else { break };
                    trace!(%from, ?body, "election message");
                    self.core.on_message(from, body)
                }

                () = tokio::time::sleep_until(timer), if self.deadline.is_some() => {
                    self.deadline = None;
                    self.core.on_timeout()
                }

                _ = poll.tick() => {
                    trace!("starting periodic election round");
                    self.core.start_round()
                }
            };
            self.apply(outputs).await;
        }
        debug!("elector stopped");
    }

    async fn apply(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Send(to, message) => self.outbox.send(to, message).await,
                Output::ArmTimer => {
                    self.deadline = Some(Instant::now() + self.config.reply_timeout);
                }
                Output::Elected(leader) => {
                    info!(%leader, "leader elected");
                    self.leader_tx.send_replace(Some(leader));
                }
            }
        }
        self.state_tx.send_if_modified(|state| {
            let changed = *state != self.core.state();
            *state = self.core.state();
            changed
        });
    }
}
