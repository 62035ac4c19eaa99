//! Shared types for the synod replicated log
//!
//! This crate holds everything two nodes must agree on to talk to each other:
//! identifiers, the static cluster table, the wire messages and their codec,
//! and the [`Replicated`] value trait.

#![warn(clippy::pedantic)]

pub mod cluster;
pub mod codec;
pub mod error;
pub mod ids;
pub mod message;
pub mod value;

pub use cluster::{ClusterTable, Member};
pub use codec::{DatagramCodec, MAX_DATAGRAM, decode_datagram, encode_datagram};
pub use error::{
    ClusterError, CodecError, ConflictError, NodeContext, NodeError, OperationContext,
    SlotContext, StoreError,
};
pub use ids::{NodeId, ProposalNumber, Slot};
pub use message::{Accepted, ElectionMessage, Envelope, Intent, PaxosMessage};
pub use value::Replicated;
