//! Identifiers for TRIBUTARY entities.
//!
//! All IDs are small integers so they stay cheap on the wire. Chain IDs
//! embed the allocating node in their high bits, which keeps them unique
//! across the cluster without coordination.

use serde::{Deserialize, Serialize};

/// Number of low bits of a [`ChainId`] holding the per-node sequence
const CHAIN_SEQ_BITS: u32 = 48;

/// Node identifier - index of a worker node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    /// Create from a raw node index
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw node index
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Get as a usize, for indexing
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// Chain identifier - unique across the cluster for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(u64);

impl ChainId {
    /// Create from a raw value
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Compose from the allocating node and its local sequence number
    #[must_use]
    pub const fn from_parts(node: NodeId, seq: u64) -> Self {
        Self(((node.0 as u64) << CHAIN_SEQ_BITS) | (seq & ((1 << CHAIN_SEQ_BITS) - 1)))
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Node that allocated this ID
    #[must_use]
    pub const fn node(&self) -> NodeId {
        NodeId((self.0 >> CHAIN_SEQ_BITS) as u32)
    }

    /// Per-node sequence number
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.0 & ((1 << CHAIN_SEQ_BITS) - 1)
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chain_{}.{}", self.node().0, self.seq())
    }
}

/// Submission identifier - one submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubmissionId(u32);

impl SubmissionId {
    /// Create from a raw value
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Bucket identifier - unique within a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketId(u32);

impl BucketId {
    /// Create from a raw value
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bucket_{}", self.0)
    }
}

/// Split stream identifier - unique within a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SplitId(u64);

impl SplitId {
    /// Create from a raw value
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SplitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "split_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_parts() {
        let node = NodeId::new(5);
        let id = ChainId::from_parts(node, 42);
        assert_eq!(id.node(), node);
        assert_eq!(id.seq(), 42);
    }

    #[test]
    fn test_chain_id_unique_across_nodes() {
        let a = ChainId::from_parts(NodeId::new(0), 1);
        let b = ChainId::from_parts(NodeId::new(1), 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(NodeId::new(3).to_string(), "node_3");
        assert_eq!(SubmissionId::new(9).to_string(), "sub_9");
        assert_eq!(BucketId::new(42).to_string(), "bucket_42");
        assert_eq!(SplitId::new(1).to_string(), "split_1");
        assert_eq!(ChainId::from_parts(NodeId::new(2), 7).to_string(), "chain_2.7");
    }

    #[test]
    fn test_id_ord() {
        let id1 = ChainId::from_raw(1);
        let id2 = ChainId::from_raw(2);
        // IDs are comparable for deterministic ordering
        assert!(id1 < id2);
    }
}
