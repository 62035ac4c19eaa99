//! Per-slot Synod consensus with Bully leader election
//!
//! Every log slot is an independent single-decree Paxos instance. A node runs
//! one of each unit below as its own tokio task; units share no state and
//! talk only through queues, watch channels and datagrams.
//!
//! # Architecture
//!
//! - **Acceptor** ([`acceptor::Acceptor`]): answers Prepare/Accept per slot,
//!   records commits in the [`CommittedLog`]
//! - **Proposer** ([`proposer::Proposer`]): drives slots through both phases
//!   and retries with higher numbers
//! - **Tallies** ([`tally::TallyUnit`]): count Promises and Acks, report
//!   majorities to the proposer
//! - **Elector** ([`election::Elector`]): Bully election over the control port
//!
//! The state transitions themselves live in [`core`] with no I/O, so the
//! Stateright model checks the same code the units run.

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod config;
pub mod core;
pub mod election;
pub mod log;
pub mod proposer;
pub mod router;
pub mod store;
pub mod tally;
pub mod transport;

pub use acceptor::{Acceptor, AcceptorSnapshot};
pub use config::{AcceptorConfig, BackoffConfig, ElectionConfig, ProposerConfig};
pub use election::Elector;
pub use log::{CommittedLog, Recorded};
pub use proposer::{Decision, DecisionReply, Proposer, ProposerLinks, ProposerRequest, ProposerSnapshot, RoundView};
pub use router::Router;
pub use store::{MemoryStore, PersistedState, StateStore};
pub use tally::{TallyRequest, TallyUnit};
pub use transport::{Inbox, Outbox, Port, Transport};
