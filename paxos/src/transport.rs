//! Datagram transport.
//!
//! Delivery is unreliable and unordered. Every datagram is one postcard
//! [`Envelope`]; anything that fails to decode, or claims to come from a node
//! outside the cluster table, is dropped before it reaches a unit.

use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use error_stack::Report;
use synod_core::{
    ClusterTable, CodecError, Envelope, MAX_DATAGRAM, NodeId, decode_datagram, encode_datagram,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// An unreliable datagram socket.
pub trait Transport: Send + Sync + 'static {
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

impl Transport for tokio::net::UdpSocket {
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send {
        tokio::net::UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        tokio::net::UdpSocket::recv_from(self, buf)
    }
}

/// Which of a member's two ports a channel talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Port {
    Data,
    Control,
}

/// Sending half of a channel: encodes, addresses and sends envelopes.
///
/// Messages addressed to this node itself skip the socket and go straight
/// into the loopback queue, when one is configured.
pub struct Outbox<T, M> {
    id: NodeId,
    cluster: Arc<ClusterTable>,
    transport: Arc<T>,
    port: Port,
    loopback: Option<mpsc::Sender<Envelope<M>>>,
}

impl<T, M> Clone for Outbox<T, M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cluster: Arc::clone(&self.cluster),
            transport: Arc::clone(&self.transport),
            port: self.port,
            loopback: self.loopback.clone(),
        }
    }
}

impl<T, M> Outbox<T, M>
where
    T: Transport,
    M: Serialize + Clone + Send + 'static,
{
    pub fn new(id: NodeId, cluster: Arc<ClusterTable>, transport: Arc<T>, port: Port) -> Self {
        Self {
            id,
            cluster,
            transport,
            port,
            loopback: None,
        }
    }

    #[must_use]
    pub fn with_loopback(mut self, loopback: mpsc::Sender<Envelope<M>>) -> Self {
        self.loopback = Some(loopback);
        self
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<ClusterTable> {
        &self.cluster
    }

    /// Check that `body` encodes into a single datagram, returning its size.
    pub fn fits(&self, body: &M) -> Result<usize, Report<CodecError>> {
        encode_datagram(Envelope { from: self.id, body }).map(|datagram| datagram.len())
    }

    /// Send one message. Failures are logged and treated as a lost datagram.
    pub async fn send(&self, to: NodeId, body: M) {
        let envelope = Envelope { from: self.id, body };
        if to == self.id
            && let Some(loopback) = &self.loopback
        {
            if loopback.try_send(envelope).is_err() {
                warn!(node = %to, "loopback queue full, dropping message");
            }
            return;
        }

        let addr = match self.port {
            Port::Data => self.cluster.data_addr(to),
            Port::Control => self.cluster.control_addr(to),
        };
        let Some(addr) = addr else {
            warn!(node = %to, "no address for node");
            return;
        };
        let datagram = match encode_datagram(envelope) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(node = %to, error = ?e, "failed to encode message");
                return;
            }
        };
        if let Err(e) = self.transport.send_to(&datagram, addr).await {
            warn!(node = %to, %addr, error = %e, "send failed");
        }
    }

    /// Send the same message to every member, this node included.
    pub async fn broadcast(&self, body: M) {
        let ids: Vec<NodeId> = self.cluster.ids().collect();
        for id in ids {
            self.send(id, body.clone()).await;
        }
    }
}

/// Receiving half of a channel.
///
/// Reads datagrams until cancelled, handing every well-formed envelope from a
/// cluster member to `deliver`. The loopback queue, if any, is drained the
/// same way so local and remote messages share one path.
pub struct Inbox<T, M> {
    transport: Arc<T>,
    cluster: Arc<ClusterTable>,
    loopback: Option<mpsc::Receiver<Envelope<M>>>,
    _marker: PhantomData<fn() -> M>,
}

impl<T, M> Inbox<T, M>
where
    T: Transport,
    M: DeserializeOwned + Send + 'static,
{
    pub fn new(transport: Arc<T>, cluster: Arc<ClusterTable>) -> Self {
        Self {
            transport,
            cluster,
            loopback: None,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn with_loopback(mut self, loopback: mpsc::Receiver<Envelope<M>>) -> Self {
        self.loopback = Some(loopback);
        self
    }

    pub async fn run(mut self, cancel: CancellationToken, mut deliver: impl FnMut(Envelope<M>)) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(envelope) = recv_loopback(&mut self.loopback) => deliver(envelope),
                received = self.transport.recv_from(&mut buf) => {
                    match received {
                        Ok((len, addr)) => {
                            if let Some(envelope) = self.accept(&buf[..len], addr) {
                                deliver(envelope);
                            }
                        }
                        Err(e) => debug!(error = %e, "recv failed"),
                    }
                }
            }
        }
    }

    fn accept(&self, datagram: &[u8], addr: SocketAddr) -> Option<Envelope<M>> {
        let envelope: Envelope<M> = match decode_datagram(datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%addr, error = ?e, "dropping malformed datagram");
                return None;
            }
        };
        if !self.cluster.contains(envelope.from) {
            trace!(%addr, from = %envelope.from, "dropping datagram from unknown sender");
            return None;
        }
        Some(envelope)
    }
}

async fn recv_loopback<M>(loopback: &mut Option<mpsc::Receiver<Envelope<M>>>) -> Option<Envelope<M>> {
    match loopback {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
