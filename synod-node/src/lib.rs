//! Synod node
//!
//! Runs one member of a synod cluster: the acceptor, proposer, tallies,
//! elector and intent driver from `synod-paxos`, each on its own task, plus a
//! fjall-backed [`StateStore`](synod_paxos::StateStore) and the REPL used by
//! the `synod-node` binary.

#![warn(clippy::pedantic)]

pub mod driver;
pub mod node;
pub mod repl;
pub mod state_store;

pub use driver::IntentOutcome;
pub use node::{Node, NodeConfig};
pub use repl::{Calendar, ReplContext};
pub use state_store::FjallStore;
