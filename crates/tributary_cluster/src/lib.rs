//! TRIBUTARY Cluster
//!
//! Everything around the executor that makes a node: the bounded chain
//! queue, the handler threads draining it, the transport carrying
//! chains, bucket data, cache entries and completion reports between
//! nodes, and completion tracking of submissions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod handler;
pub mod node;
pub mod queue;
pub mod tracker;
pub mod transport;

pub use cluster::LoopbackCluster;
pub use handler::{ChainRunner, HandlerPool, PoolStats};
pub use node::{Node, NodeError, SubmissionHandle};
pub use queue::{ChainQueue, QueueError};
pub use tracker::{ChainReport, CompletionTracker, SubmissionStatus};
pub use transport::{LoopbackNetwork, MessageHandler, NetworkStats, Transport, TransportError, WireMessage};
