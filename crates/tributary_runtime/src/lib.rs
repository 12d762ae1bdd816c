//! TRIBUTARY Runtime
//!
//! Executes chains: ordered step sequences through which records flow by
//! direct calls. Steps may fork new chains at runtime (branches and
//! splits) or move the rest of their chain next to a bucket on another
//! node; the executor keeps the child counters that let the cluster tell
//! when a submission is done.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod builtin;
pub mod context;
mod counters;
pub mod executor;
pub mod fork;
pub mod input;
pub mod monitor;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use action::{Action, ActionOutput, MigrationTarget};
pub use context::{ChainDispatcher, HandlerState, HandlerStatus, IdAllocator, NodeContext};
pub use executor::{ActionContext, ChainExecutor, ExecutionSummary};
pub use fork::{SplitOutput, TransferHandle};
pub use input::{DummyInput, OpenedInput, SplitInput, TupleIterator, VecInput, open_input};
pub use monitor::{CHAINS_DYNAMICALLY_GENERATED, StatisticsCollector, SubmissionStats};
pub use registry::{ActionFactory, ActionRegistry, RegistryError};
