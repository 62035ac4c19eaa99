//! Data-port dispatch: hands each incoming message to the unit that owns it.

use synod_core::{Envelope, Intent, NodeId, PaxosMessage};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::core::{AckTally, PromiseTally};
use crate::tally::TallyRequest;

/// Queue handles for every unit that consumes data-port messages.
///
/// Prepare, Accept and Commit go to the acceptor; Promises and Acks to their
/// tallies; forwarded intents to the intent driver. A full queue behaves like
/// a lost datagram.
pub struct Router<V: Clone + Eq + Send + 'static, I> {
    pub acceptor: mpsc::Sender<Envelope<PaxosMessage<V, I>>>,
    pub promises: mpsc::Sender<TallyRequest<PromiseTally<V>>>,
    pub acks: mpsc::Sender<TallyRequest<AckTally<V>>>,
    pub forwarded: mpsc::Sender<(NodeId, Intent<I>)>,
}

impl<V, I> Router<V, I>
where
    V: Clone + Eq + Send + 'static,
{
    pub fn route(&self, envelope: Envelope<PaxosMessage<V, I>>) {
        let from = envelope.from;
        let kind = envelope.body.kind();
        let full = match envelope.body {
            PaxosMessage::Prepare { .. }
            | PaxosMessage::Accept { .. }
            | PaxosMessage::Commit { .. }
            | PaxosMessage::Sync { .. } => is_full(self.acceptor.try_send(envelope)),
            PaxosMessage::Promise {
                number,
                slot,
                accepted,
            } => is_full(self.promises.try_send(TallyRequest::Reply {
                from,
                slot,
                number,
                reply: accepted,
            })),
            PaxosMessage::Ack {
                number,
                slot,
                value,
            } => is_full(self.acks.try_send(TallyRequest::Reply {
                from,
                slot,
                number,
                reply: value,
            })),
            PaxosMessage::Forward(intent) => is_full(self.forwarded.try_send((from, intent))),
        };
        if full {
            warn!(%from, kind, "queue full, dropping message");
        }
    }
}

fn is_full<T>(result: Result<(), TrySendError<T>>) -> bool {
    match result {
        Ok(()) => false,
        Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => {
            trace!("unit stopped, dropping message");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use synod_core::{ProposalNumber, Slot};

    use super::*;

    #[test]
    fn messages_reach_their_owner() {
        let (acceptor, mut acceptor_rx) = mpsc::channel(4);
        let (promises, mut promises_rx) = mpsc::channel(4);
        let (acks, mut acks_rx) = mpsc::channel(4);
        let (forwarded, mut forwarded_rx) = mpsc::channel(4);
        let router: Router<u8, u8> = Router {
            acceptor,
            promises,
            acks,
            forwarded,
        };

        let from = NodeId(2);
        let send = |body| router.route(Envelope { from, body });
        send(PaxosMessage::Prepare {
            number: ProposalNumber(1),
            slot: Slot(0),
        });
        send(PaxosMessage::Commit {
            slot: Slot(0),
            value: 3,
        });
        send(PaxosMessage::Promise {
            number: ProposalNumber(1),
            slot: Slot(0),
            accepted: None,
        });
        send(PaxosMessage::Ack {
            number: ProposalNumber(1),
            slot: Slot(0),
            value: 3,
        });
        send(PaxosMessage::Forward(Intent::Insert(7)));
        send(PaxosMessage::Sync {
            next: Slot(1),
            missing: vec![],
        });

        assert_eq!(acceptor_rx.try_recv().unwrap().body.kind(), "prepare");
        assert_eq!(acceptor_rx.try_recv().unwrap().body.kind(), "commit");
        assert_eq!(acceptor_rx.try_recv().unwrap().body.kind(), "sync");
        assert!(matches!(
            promises_rx.try_recv().unwrap(),
            TallyRequest::Reply { from: NodeId(2), reply: None, .. }
        ));
        assert!(matches!(
            acks_rx.try_recv().unwrap(),
            TallyRequest::Reply { reply: 3, .. }
        ));
        assert_eq!(forwarded_rx.try_recv().unwrap(), (from, Intent::Insert(7)));
    }
}
