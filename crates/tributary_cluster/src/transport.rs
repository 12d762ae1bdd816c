//! Messages between nodes and the transport carrying them.

use crate::tracker::ChainReport;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use tributary_core::{Chain, CoreError, CoreResult, NodeId, SubmissionId, Value};
use tributary_storage::{BucketAlert, BucketShipment};

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No node registered under that ID
    #[error("Node unavailable: {0}")]
    NodeUnavailable(NodeId),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The receiving node failed to apply the message
    #[error("Delivery to {node} failed: {reason}")]
    Delivery {
        /// Receiving node
        node: NodeId,
        /// Failure reported by the receiver
        reason: String,
    },
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        CoreError::io(err.to_string())
    }
}

/// Everything nodes say to each other
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// A chain to queue on the receiver
    Chain(Chain),
    /// Outcome of a chain execution, sent to the submission node
    Completion(ChainReport),
    /// Replicated submission cache entry
    CacheEntry {
        /// Submission
        submission: SubmissionId,
        /// Cache key
        key: String,
        /// Cache value
        value: Value,
    },
    /// Tuples and writer report for a bucket on the receiver
    BucketData(BucketShipment),
    /// Notice that a bucket on the receiver will be written
    BucketAlert(BucketAlert),
}

impl WireMessage {
    /// Short name of the message kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Chain(_) => "chain",
            Self::Completion(_) => "completion",
            Self::CacheEntry { .. } => "cache_entry",
            Self::BucketData(_) => "bucket_data",
            Self::BucketAlert(_) => "bucket_alert",
        }
    }

    /// Encode for the wire
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(|err| TransportError::Serialization(err.to_string()))
    }

    /// Decode from the wire
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a message
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        postcard::from_bytes(bytes).map_err(|err| TransportError::Serialization(err.to_string()))
    }
}

/// Receiving end of a node
pub trait MessageHandler: Send + Sync {
    /// Apply a message sent by `from`
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be applied
    fn handle_message(&self, from: NodeId, message: WireMessage) -> CoreResult<()>;
}

/// Point-to-point delivery of encoded messages
pub trait Transport: Send + Sync {
    /// Deliver `payload` from one node to another
    ///
    /// # Errors
    ///
    /// Returns error if the target is unknown or rejects the message
    fn send(&self, from: NodeId, to: NodeId, payload: Bytes) -> Result<(), TransportError>;

    /// Encode and deliver a message
    ///
    /// # Errors
    ///
    /// Returns error if encoding or delivery fails
    fn send_message(&self, from: NodeId, to: NodeId, message: &WireMessage) -> Result<(), TransportError> {
        self.send(from, to, message.encode()?)
    }
}

/// Transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Messages delivered
    pub messages: u64,
    /// Encoded bytes delivered
    pub bytes: u64,
}

/// In-process network connecting the nodes of one process.
///
/// Delivery is synchronous, on the sender's thread, after a full encode
/// and decode of the message.
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: RwLock<HashMap<NodeId, Weak<dyn MessageHandler>>>,
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl LoopbackNetwork {
    /// Create a network with no node
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node
    pub fn register(&self, node: NodeId, handler: Weak<dyn MessageHandler>) {
        self.nodes.write().insert(node, handler);
    }

    /// Detach a node
    pub fn unregister(&self, node: NodeId) {
        self.nodes.write().remove(&node);
    }

    /// Attached nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Delivery counters
    #[must_use]
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            messages: self.messages.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

impl Transport for LoopbackNetwork {
    fn send(&self, from: NodeId, to: NodeId, payload: Bytes) -> Result<(), TransportError> {
        let handler = self
            .nodes
            .read()
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(TransportError::NodeUnavailable(to))?;
        let message = WireMessage::decode(&payload)?;

        tracing::trace!(%from, %to, kind = message.kind(), bytes = payload.len(), "message");
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);

        handler
            .handle_message(from, message)
            .map_err(|err| TransportError::Delivery {
                node: to,
                reason: err.to_string(),
            })
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("nodes", &self.node_count())
            .field("stats", &self.stats())
            .finish()
    }
}
