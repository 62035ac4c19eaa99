//! Pure state machine core - no I/O, no async
//!
//! This module contains the state transition logic shared between:
//! - The async units (`acceptor`, `proposer`, `tally`, `election`)
//! - The Stateright model checker tests
//!
//! # Modules
//!
//! - [`acceptor`]: per-slot acceptor state (`AcceptorCore`)
//! - [`proposer`]: proposal numbering and in-flight rounds (`ProposerCore`)
//! - [`quorum`]: majority arithmetic and reply tallies
//! - [`election`]: Bully election (`BullyCore`)

pub mod acceptor;
pub mod election;
pub mod proposer;
pub mod quorum;

pub use acceptor::{AcceptResult, AcceptorCore, PrepareResult, SlotState};
pub use election::{BullyCore, ElectionState, Output};
pub use proposer::{Ballots, Phase, ProposerCore, Round};
pub use quorum::{AckQuorum, AckTally, PromiseQuorum, PromiseTally, Tally, choose, majority};
