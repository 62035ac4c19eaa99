//! Identifier types shared by every node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Cluster member identifier, as listed in the membership file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Position in the replicated log; each slot is an independent Synod instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Slot(pub u64);

impl Slot {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Globally ordered proposal number.
///
/// Numbers are strided across the cluster: `round * cluster_size + rank`,
/// where `rank` is the node's position in the ascending order of the cluster
/// table. Two nodes can never produce the same number, and a node's numbers
/// grow with its round counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProposalNumber(pub u64);

impl ProposalNumber {
    /// # Panics
    ///
    /// Panics if `rank >= cluster_size`.
    #[must_use]
    pub fn new(round: u64, rank: u32, cluster_size: u32) -> Self {
        assert!(rank < cluster_size, "rank {rank} outside cluster of {cluster_size}");
        Self(round * u64::from(cluster_size) + u64::from(rank))
    }

    /// The round this number was generated in.
    #[must_use]
    pub fn round(self, cluster_size: u32) -> u64 {
        self.0 / u64::from(cluster_size)
    }

    /// Rank of the node that generated this number.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn rank(self, cluster_size: u32) -> u32 {
        (self.0 % u64::from(cluster_size)) as u32
    }
}

impl fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
