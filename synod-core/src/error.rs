//! Error types and structured `error_stack` context types.

use std::fmt;

use crate::{NodeId, Slot};

/// Wire encoding or decoding failed.
#[derive(Debug)]
pub struct CodecError;

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("codec error")
    }
}

impl std::error::Error for CodecError {}

/// The cluster membership table could not be loaded.
#[derive(Debug)]
pub struct ClusterError;

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid cluster table")
    }
}

impl std::error::Error for ClusterError {}

/// Durable state could not be read or written.
#[derive(Debug)]
pub struct StoreError;

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("state store error")
    }
}

impl std::error::Error for StoreError {}

/// A node operation failed.
#[derive(Debug)]
pub struct NodeError;

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("node error")
    }
}

impl std::error::Error for NodeError {}

/// An intent does not apply to the current value.
#[derive(Debug)]
pub struct ConflictError;

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("intent conflicts with the current value")
    }
}

impl std::error::Error for ConflictError {}

/// Error context: log slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotContext {
    pub slot: Slot,
}

impl SlotContext {
    #[must_use]
    pub fn new(slot: Slot) -> Self {
        Self { slot }
    }
}

impl fmt::Display for SlotContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot: {}", self.slot.0)
    }
}

/// Error context: cluster member.
#[derive(Debug, Clone, Copy)]
pub struct NodeContext {
    pub node_id: NodeId,
}

impl NodeContext {
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }
}

impl fmt::Display for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node: {}", self.node_id.0)
    }
}

/// Error context: what operation was in progress.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation: &'static str,
}

impl OperationContext {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self { operation }
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "while {}", self.operation)
    }
}

impl OperationContext {
    pub const LOADING_STATE: Self = Self {
        operation: "loading persisted state",
    };
    pub const SAVING_SLOT: Self = Self {
        operation: "saving acceptor slot",
    };
    pub const SAVING_COMMIT: Self = Self {
        operation: "recording committed value",
    };
    pub const SAVING_ROUND: Self = Self {
        operation: "reserving proposer round",
    };
    pub const PROPOSING: Self = Self {
        operation: "proposing via Paxos",
    };
    pub const FORWARDING: Self = Self {
        operation: "forwarding intent to leader",
    };
    pub const APPLYING_INTENT: Self = Self {
        operation: "applying intent",
    };
}
