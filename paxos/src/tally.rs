//! Tally units.
//!
//! A tally unit owns one [`Tally`] and nothing else. Registrations, replies
//! and forgets arrive on its queue; every `tally_interval` it scans for rounds
//! that reached a majority and hands them to the proposer.
//!
//! The proposer also sends into this unit's queue, so outcomes are handed over
//! with `try_send`. Whatever does not fit waits for the next scan.

use std::collections::VecDeque;
use std::time::Duration;

use synod_core::{NodeId, ProposalNumber, Slot};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::Tally;

/// Message to a tally unit.
pub enum TallyRequest<T: Tally> {
    Track {
        slot: Slot,
        number: ProposalNumber,
        value: T::Value,
    },
    Reply {
        from: NodeId,
        slot: Slot,
        number: ProposalNumber,
        reply: T::Reply,
    },
    Forget {
        slot: Slot,
    },
}

pub struct TallyUnit<T: Tally> {
    name: &'static str,
    tally: T,
    interval: Duration,
}

impl<T: Tally> TallyUnit<T> {
    pub fn new(name: &'static str, tally: T, interval: Duration) -> Self {
        Self {
            name,
            tally,
            interval,
        }
    }

    /// Run until cancelled or until the proposer goes away.
    pub async fn run<E>(
        mut self,
        mut requests: mpsc::Receiver<TallyRequest<T>>,
        outcomes: mpsc::Sender<E>,
        cancel: CancellationToken,
    ) where
        E: From<T::Outcome> + Send + 'static,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending = VecDeque::new();

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                request = requests.recv() => {
                    let Some(request) = request else { break };
                    self.apply(request);
                }

                _ = ticker.tick() => {
                    pending.extend(self.tally.scan().into_iter().map(E::from));
                    while let Some(outcome) = pending.pop_front() {
                        match outcomes.try_send(outcome) {
                            Ok(()) => {}
                            Err(TrySendError::Full(outcome)) => {
                                trace!(tally = self.name, held = pending.len() + 1, "proposer queue full");
                                pending.push_front(outcome);
                                break;
                            }
                            Err(TrySendError::Closed(_)) => {
                                debug!(tally = self.name, "proposer gone, stopping");
                                return;
                            }
                        }
                    }
                }
            }
        }
        debug!(tally = self.name, "tally unit stopped");
    }

    fn apply(&mut self, request: TallyRequest<T>) {
        match request {
            TallyRequest::Track {
                slot,
                number,
                value,
            } => self.tally.track(slot, number, value),
            TallyRequest::Reply {
                from,
                slot,
                number,
                reply,
            } => {
                if !self.tally.record(from, slot, number, reply) {
                    trace!(tally = self.name, %from, %slot, %number, "ignoring stale or duplicate reply");
                }
            }
            TallyRequest::Forget { slot } => self.tally.forget(slot),
        }
    }
}
