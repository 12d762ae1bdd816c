//! Processing steps.

use crate::executor::ActionContext;
use tributary_core::{BucketId, CoreResult, NodeId, Tuple, Value};

/// Where a step wants the rest of its chain to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationTarget {
    /// Node to move to; `None` leaves the choice to the cluster
    pub node: Option<NodeId>,
    /// Bucket the continuation reads
    pub bucket: BucketId,
}

/// Sink for tuples produced by a step
pub trait ActionOutput {
    /// Deliver a tuple downstream
    ///
    /// # Errors
    ///
    /// Returns error if a downstream step fails
    fn output(&mut self, tuple: &Tuple) -> CoreResult<()>;

    /// Deliver a tuple assembled from fields
    ///
    /// # Errors
    ///
    /// Returns error if a downstream step fails
    fn output_values(&mut self, values: &[Value]) -> CoreResult<()>;
}

/// One composable processing step.
///
/// A fresh instance is created for every chain execution, so state kept
/// in `self` lives for exactly one run. Callbacks may emit tuples and use
/// the services of [`ActionContext`].
pub trait Action: Send {
    /// Called once before any tuple, in step order
    ///
    /// # Errors
    ///
    /// Returns error to abort the chain
    fn start_process(&mut self, _ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    /// Called for every input tuple
    ///
    /// # Errors
    ///
    /// Returns error to abort the chain
    fn process(&mut self, tuple: &Tuple, ctx: &mut ActionContext<'_>) -> CoreResult<()>;

    /// Called once after the input is exhausted, in step order
    ///
    /// # Errors
    ///
    /// Returns error to abort the chain
    fn stop_process(&mut self, _ctx: &mut ActionContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    /// Migration declared by this step; later steps then run elsewhere
    fn migration_target(&self) -> Option<MigrationTarget> {
        None
    }
}
