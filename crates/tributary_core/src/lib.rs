//! TRIBUTARY Core Types
//!
//! This crate contains pure types and logic with no I/O beyond config loading.
//! Chain descriptors and tuples are serializable with a stable wire encoding.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod config;
pub mod error;
pub mod id;
pub mod tuple;

// Re-exports
pub use chain::{ActionConf, ActionSequence, Chain, ChainStep, CounterDeltas, InputSource};
pub use config::{EngineConfig, OverflowPolicy};
pub use error::{CoreError, CoreResult};
pub use id::{BucketId, ChainId, NodeId, SplitId, SubmissionId};
pub use tuple::{Tuple, Value};
