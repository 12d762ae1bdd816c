//! Chain executor: interprets one chain's step sequence.
//!
//! Tuples flow through the steps by direct calls: a step emitting a tuple
//! runs the next step's `process` before `output` returns. The executor
//! keeps the steps and its bookkeeping in separate fields so that a step
//! can be borrowed mutably while its [`ActionContext`] borrows the frame
//! and the steps downstream of it.

use crate::action::{Action, ActionOutput, MigrationTarget};
use crate::context::{ChainDispatcher, HandlerStatus, NodeContext};
use crate::fork::{SplitOutput, TransferBuffer, TransferHandle};
use crate::input::OpenedInput;
use std::collections::HashMap;
use std::sync::Arc;
use tributary_core::{
    ActionSequence, BucketId, Chain, ChainId, CoreError, CoreResult, CounterDeltas, InputSource,
    NodeId, SubmissionId, Tuple, Value,
};
use tributary_storage::{Bucket, SplitWriter, sync_token_key};

/// Bookkeeping of one chain execution, shared by all its steps
pub(crate) struct ChainFrame {
    pub(crate) chain: Chain,
    pub(crate) node: Arc<NodeContext>,
    pub(crate) dispatcher: Arc<dyn ChainDispatcher>,
    pub(crate) handler: Option<Arc<HandlerStatus>>,
    /// Steps instantiated here; the rest belong to the continuation
    pub(crate) local_steps: usize,
    pub(crate) migration: Option<MigrationTarget>,
    pub(crate) stopping: bool,
    pub(crate) runtime_branching: Vec<i32>,
    pub(crate) smallest_runtime_branching: Option<usize>,
    /// Counter deltas not yet handed to anyone
    pub(crate) new_children: CounterDeltas,
    pub(crate) open_streams: Vec<SplitWriter>,
    pub(crate) transfers: HashMap<TransferHandle, TransferBuffer>,
    pub(crate) continuation_dispatched: bool,
    scratch: Vec<Tuple>,
}

/// What a step sees while it runs: its position, the steps after it and
/// the services of the executor.
pub struct ActionContext<'a> {
    frame: &'a mut ChainFrame,
    downstream: &'a mut [Box<dyn Action>],
    index: usize,
}

impl ActionOutput for ActionContext<'_> {
    fn output(&mut self, tuple: &Tuple) -> CoreResult<()> {
        let Some((next, rest)) = self.downstream.split_first_mut() else {
            return Ok(());
        };
        let mut ctx = ActionContext {
            frame: &mut *self.frame,
            downstream: rest,
            index: self.index + 1,
        };
        next.process(tuple, &mut ctx)
    }

    fn output_values(&mut self, values: &[Value]) -> CoreResult<()> {
        if self.downstream.is_empty() {
            return Ok(());
        }
        let mut tuple = std::mem::take(&mut self.frame.scratch[self.index]);
        tuple.set(values);
        let result = self.output(&tuple);
        self.frame.scratch[self.index] = tuple;
        result
    }
}

impl ActionContext<'_> {
    /// Index of the running step
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether this chain is the principal owner of the running step
    #[must_use]
    pub fn is_principal_branch(&self) -> bool {
        self.frame.chain.steps[self.index].root
    }

    /// Fork a new chain running `actions` and then the rest of this chain
    ///
    /// # Errors
    ///
    /// Returns error if `actions` is empty or the chain cannot be queued
    pub fn branch(&mut self, actions: &ActionSequence) -> CoreResult<()> {
        self.frame.branch(self.index, actions)
    }

    /// Feed a new chain through a split stream.
    ///
    /// The new chain runs `actions`, then this chain's steps starting
    /// `reconnect_at` steps after the running one; `-1` reconnects nowhere.
    ///
    /// # Errors
    ///
    /// Returns error if the new chain would have no steps or cannot start
    pub fn split(
        &mut self,
        reconnect_at: i32,
        actions: Option<&ActionSequence>,
    ) -> CoreResult<SplitOutput> {
        self.frame.split(self.index, reconnect_at, actions)
    }

    /// Open a writer on a bucket of `node`
    ///
    /// # Errors
    ///
    /// Returns error if the target cannot be alerted
    pub fn start_transfer(
        &mut self,
        node: NodeId,
        bucket: BucketId,
        sort: Option<Vec<usize>>,
    ) -> CoreResult<TransferHandle> {
        self.frame.start_transfer(node, bucket, sort)
    }

    /// Write a tuple through an open transfer
    ///
    /// # Errors
    ///
    /// Returns error if the transfer is not open
    pub fn write_transfer(&mut self, handle: TransferHandle, tuple: &Tuple) -> CoreResult<()> {
        self.frame.write_transfer(handle, tuple)
    }

    /// Close a transfer, handing over the tuples and this writer's accounting
    ///
    /// # Errors
    ///
    /// Returns error if the transfer is not open or delivery fails
    pub fn finish_transfer(&mut self, handle: TransferHandle, decrease_counter: bool) -> CoreResult<()> {
        self.frame.finish_transfer(self.index, handle, decrease_counter)
    }

    /// Block until `token` is signalled for this submission
    ///
    /// # Errors
    ///
    /// Returns error if the wait is cancelled
    pub fn wait_for(&mut self, token: i32) -> CoreResult<()> {
        let frame = &*self.frame;
        if let Some(handler) = &frame.handler {
            handler.set_waiting();
        }
        let result = frame
            .node
            .cache()
            .get_blocking(frame.chain.submission_id, &sync_token_key(token));
        if let Some(handler) = &frame.handler {
            handler.set_active();
        }
        tracing::trace!(chain = %frame.chain.chain_id, token, "synchronization token received");
        result.map(|_| ())
    }

    /// Signal `token`, releasing current and future waiters
    ///
    /// # Errors
    ///
    /// Returns error if the signal cannot be broadcast
    pub fn signal(&mut self, token: i32) -> CoreResult<()> {
        let key = sync_token_key(token);
        let value = Value::Int(1);
        let frame = &*self.frame;
        frame
            .node
            .cache()
            .put(frame.chain.submission_id, key.clone(), value.clone());
        if !frame.node.is_local_mode() {
            frame
                .dispatcher
                .broadcast_cache(frame.chain.submission_id, &key, &value)?;
        }
        Ok(())
    }

    /// Read a submission cache entry
    #[must_use]
    pub fn get_cache(&self, key: &str) -> Option<Value> {
        self.frame.node.cache().get(self.frame.chain.submission_id, key)
    }

    /// Write a submission cache entry on this node
    pub fn put_cache(&mut self, key: &str, value: Value) {
        self.frame
            .node
            .cache()
            .put(self.frame.chain.submission_id, key, value);
    }

    /// Remove a submission cache entry on this node
    pub fn remove_cache(&mut self, key: &str) -> Option<Value> {
        self.frame
            .node
            .cache()
            .remove(self.frame.chain.submission_id, key)
    }

    /// Keys of the submission cache on this node
    #[must_use]
    pub fn cache_keys(&self) -> Vec<String> {
        self.frame.node.cache().keys(self.frame.chain.submission_id)
    }

    /// Replicate cache entries to every other node
    ///
    /// # Errors
    ///
    /// Returns error if an entry cannot be delivered
    pub fn broadcast_cache(&mut self, keys: &[&str]) -> CoreResult<()> {
        let frame = &*self.frame;
        if frame.node.is_local_mode() || frame.node.config().node_count <= 1 {
            return Ok(());
        }
        let submission = frame.chain.submission_id;
        for key in keys {
            if let Some(value) = frame.node.cache().get(submission, key) {
                frame.dispatcher.broadcast_cache(submission, key, &value)?;
            }
        }
        Ok(())
    }

    /// Add to a statistics counter of the submission
    pub fn incr_counter(&mut self, name: &str, value: i64) {
        self.frame
            .node
            .stats()
            .add_counter(self.frame.chain.submission_id, name, value);
    }

    /// Allocate a bucket ID unique within the submission
    pub fn new_bucket_id(&mut self) -> BucketId {
        self.frame
            .node
            .ids()
            .next_bucket_id(self.frame.chain.submission_id)
    }

    /// Integer engine property
    #[must_use]
    pub fn get_system_param_int(&self, key: &str, default: i64) -> i64 {
        self.frame.node.config().get_int(key).unwrap_or(default)
    }

    /// Boolean engine property
    #[must_use]
    pub fn get_system_param_bool(&self, key: &str, default: bool) -> bool {
        self.frame.node.config().get_bool(key).unwrap_or(default)
    }

    /// String engine property
    #[must_use]
    pub fn get_system_param_str(&self, key: &str, default: &str) -> String {
        self.frame
            .node
            .config()
            .get_str(key)
            .unwrap_or(default)
            .to_string()
    }

    /// Whether the engine runs on a single node
    #[must_use]
    pub fn is_local_mode(&self) -> bool {
        self.frame.node.is_local_mode()
    }

    /// This node
    #[must_use]
    pub fn my_node_id(&self) -> NodeId {
        self.frame.node.node_id()
    }

    /// Nodes in the cluster
    #[must_use]
    pub fn node_count(&self) -> u32 {
        self.frame.node.config().node_count
    }

    /// Submission of the running chain
    #[must_use]
    pub fn submission_id(&self) -> SubmissionId {
        self.frame.chain.submission_id
    }

    /// ID of the running chain
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.frame.chain.chain_id
    }

    /// Input source of the running chain
    #[must_use]
    pub fn input_source(&self) -> &InputSource {
        &self.frame.chain.input
    }

    /// Open a bucket of this node directly
    ///
    /// # Errors
    ///
    /// Returns error if the bucket exists with another sort key
    pub fn get_bucket(&mut self, bucket: BucketId, sort: Option<Vec<usize>>) -> CoreResult<Arc<Bucket>> {
        self.frame
            .node
            .buckets()
            .get_or_create(self.frame.chain.submission_id, bucket, sort)
    }

    /// Drop every bucket and cache entry of the submission on this node
    pub fn cleanup(&mut self) {
        self.frame
            .node
            .cleanup_submission(self.frame.chain.submission_id);
    }
}

/// Result of a finished chain execution, as reported for completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Chain ID
    pub chain_id: ChainId,
    /// Parent of record
    pub parent_chain_id: Option<ChainId>,
    /// Chain that created this one
    pub creator_chain_id: Option<ChainId>,
    /// Submission
    pub submission_id: SubmissionId,
    /// Submission node
    pub submission_node: NodeId,
    /// Segment number of this execution
    pub generation: u32,
    /// Final value of the child counter
    pub children: i32,
    /// Whether the rest of the chain continues elsewhere
    pub transferred: bool,
    /// Deltas that were never forwarded to a continuation
    pub unforwarded: CounterDeltas,
}

/// Interpreter of one chain
pub struct ChainExecutor {
    actions: Vec<Box<dyn Action>>,
    frame: ChainFrame,
    started: bool,
    stopped: bool,
}

impl ChainExecutor {
    /// Build the executor of a chain.
    ///
    /// Steps are instantiated up to and including the first one declaring
    /// a migration target; the remaining steps are left to the
    /// continuation.
    ///
    /// # Errors
    ///
    /// Returns error if the chain is invalid or a step cannot be created
    pub fn build(
        chain: Chain,
        node: Arc<NodeContext>,
        dispatcher: Arc<dyn ChainDispatcher>,
        handler: Option<Arc<HandlerStatus>>,
    ) -> CoreResult<Self> {
        chain.validate(node.config().max_chain_steps)?;

        let mut actions = Vec::with_capacity(chain.len());
        let mut migration = None;
        for step in &chain.steps {
            let action = node.registry().create(&step.action)?;
            let target = action.migration_target();
            actions.push(action);
            if target.is_some() {
                migration = target;
                break;
            }
        }

        let local_steps = actions.len();
        let mut executor = Self {
            actions,
            frame: ChainFrame {
                chain,
                node,
                dispatcher,
                handler,
                local_steps,
                migration: None,
                stopping: false,
                runtime_branching: vec![0; local_steps],
                smallest_runtime_branching: None,
                new_children: CounterDeltas::new(),
                open_streams: Vec::new(),
                transfers: HashMap::new(),
                continuation_dispatched: false,
                scratch: vec![Tuple::new(); local_steps],
            },
            started: false,
            stopped: false,
        };
        if let Some(target) = migration {
            executor.move_computation(target);
        }

        tracing::debug!(
            chain = %executor.frame.chain.chain_id,
            steps = executor.frame.chain.len(),
            local_steps,
            input = executor.frame.chain.input.kind(),
            "executor built"
        );
        Ok(executor)
    }

    /// Declare that the steps after the local ones continue on `target`
    pub fn move_computation(&mut self, target: MigrationTarget) {
        tracing::debug!(
            chain = %self.frame.chain.chain_id,
            node = ?target.node,
            bucket = %target.bucket,
            "computation will move"
        );
        self.frame.migration = Some(target);
    }

    /// Chain being executed
    #[must_use]
    pub fn chain(&self) -> &Chain {
        &self.frame.chain
    }

    /// Steps executed here
    #[must_use]
    pub fn local_steps(&self) -> usize {
        self.frame.local_steps
    }

    /// Migration declared at build time
    #[must_use]
    pub fn migration(&self) -> Option<MigrationTarget> {
        self.frame.migration
    }

    /// Current value of the child counter
    #[must_use]
    pub fn total_chain_children(&self) -> i32 {
        self.frame.chain.total_chain_children
    }

    /// Counter deltas not yet forwarded
    #[must_use]
    pub fn pending_deltas(&self) -> &CounterDeltas {
        &self.frame.new_children
    }

    /// Whether `stop` already ran
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Fold counter deltas received with the input into this execution
    pub fn add_and_update_counters(&mut self, counters: CounterDeltas) {
        self.frame.add_and_update_counters(counters);
    }

    /// Run every step's start callback in order, then dispatch the
    /// continuation if the computation migrates from a principal step
    ///
    /// # Errors
    ///
    /// Returns error if a start callback fails or the continuation cannot
    /// be dispatched
    pub fn start(&mut self) -> CoreResult<()> {
        if self.started || self.stopped {
            return Err(CoreError::usage("start", "chain already started"));
        }
        self.started = true;

        let Self { actions, frame, .. } = self;
        for index in 0..actions.len() {
            let (head, downstream) = actions.split_at_mut(index + 1);
            let mut ctx = ActionContext {
                frame: &mut *frame,
                downstream,
                index,
            };
            head[index].start_process(&mut ctx)?;
        }

        frame.dispatch_continuation()
    }

    /// Deliver one input tuple to the first step
    ///
    /// # Errors
    ///
    /// Returns error if a step fails or the chain is not running
    pub fn push(&mut self, tuple: &Tuple) -> CoreResult<()> {
        if !self.started || self.stopped {
            return Err(CoreError::usage("push", "chain is not running"));
        }
        let Some((first, downstream)) = self.actions.split_first_mut() else {
            return Ok(());
        };
        let mut ctx = ActionContext {
            frame: &mut self.frame,
            downstream,
            index: 0,
        };
        first.process(tuple, &mut ctx)
    }

    /// Run every step's stop callback in order, then close the split
    /// streams opened by this chain. A second call does nothing.
    ///
    /// Every stop callback runs even if an earlier one fails; the first
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a stop callback
    pub fn stop(&mut self) -> CoreResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let Self { actions, frame, .. } = self;
        frame.stopping = true;
        let mut first_error = None;
        for index in 0..actions.len() {
            let (head, downstream) = actions.split_at_mut(index + 1);
            let mut ctx = ActionContext {
                frame: &mut *frame,
                downstream,
                index,
            };
            if let Err(err) = head[index].stop_process(&mut ctx) {
                tracing::warn!(chain = %frame.chain.chain_id, step = index, error = %err, "stop callback failed");
                first_error.get_or_insert(err);
            }
            frame.runtime_branching[index] = 0;
        }

        for stream in frame.open_streams.drain(..) {
            stream.close();
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drive the chain over its input: absorb forwarded counters, start,
    /// push every tuple, and stop even when an earlier phase failed
    ///
    /// # Errors
    ///
    /// Returns the first error of any phase
    pub fn execute(mut self, input: OpenedInput) -> CoreResult<ExecutionSummary> {
        let OpenedInput {
            mut tuples,
            forwarded,
        } = input;
        self.add_and_update_counters(forwarded);

        let run = self.start().and_then(|()| {
            while let Some(tuple) = tuples.next_tuple()? {
                self.push(&tuple)?;
            }
            Ok(())
        });
        let stop = self.stop();
        run.and(stop)?;
        Ok(self.finish())
    }

    /// Summarize the execution for completion reporting
    #[must_use]
    pub fn finish(self) -> ExecutionSummary {
        let frame = self.frame;
        if frame.migration.is_some() && !frame.new_children.is_empty() {
            tracing::warn!(
                chain = %frame.chain.chain_id,
                deltas = frame.new_children.len(),
                "counter deltas of a migrated chain were never forwarded"
            );
        }
        ExecutionSummary {
            chain_id: frame.chain.chain_id,
            parent_chain_id: frame.chain.parent_chain_id,
            creator_chain_id: frame.chain.creator_chain_id,
            submission_id: frame.chain.submission_id,
            submission_node: frame.chain.submission_node,
            generation: frame.chain.generation,
            children: frame.chain.total_chain_children,
            transferred: frame.continuation_dispatched,
            unforwarded: frame.new_children,
        }
    }
}

#[cfg(test)]
impl ChainExecutor {
    pub(crate) fn frame_for_tests(&self) -> &ChainFrame {
        &self.frame
    }
}

impl std::fmt::Debug for ChainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainExecutor")
            .field("chain", &self.frame.chain.chain_id)
            .field("local_steps", &self.frame.local_steps)
            .field("migration", &self.frame.migration)
            .field("started", &self.started)
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, journal_step, seq};
    use tributary_core::{ActionConf, Value};

    #[test]
    fn test_start_and_stop_in_order() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[journal_step("a"), journal_step("b"), journal_step("c")]));
        let mut executor = harness.build(chain);
        executor.start().unwrap();
        executor.stop().unwrap();
        assert_eq!(
            harness.journal(),
            vec!["start:a", "start:b", "start:c", "stop:a", "stop:b", "stop:c"]
        );
    }

    #[test]
    fn test_three_steps_five_records() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[journal_step("a"), journal_step("b"), journal_step("c")]));
        let mut executor = harness.build(chain);
        executor.start().unwrap();
        for v in 0..5 {
            executor.push(&Tuple::from_values(vec![Value::Int(v)])).unwrap();
        }
        executor.stop().unwrap();

        let journal = harness.journal();
        for label in ["a", "b", "c"] {
            let processed: Vec<_> = journal
                .iter()
                .filter(|e| e.starts_with(&format!("process:{}:", label)))
                .cloned()
                .collect();
            assert_eq!(
                processed,
                (0..5).map(|v| format!("process:{}:{}", label, v)).collect::<Vec<_>>()
            );
        }
        // Depth-first: record 0 reaches c before record 1 enters a
        let pos = |e: &str| journal.iter().position(|x| x == e).unwrap();
        assert!(pos("process:c:0") < pos("process:a:1"));
    }

    #[test]
    fn test_emit_from_last_step_is_noop() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[journal_step("only")]));
        let mut executor = harness.build(chain);
        executor.start().unwrap();
        executor.push(&Tuple::new()).unwrap();
        executor.stop().unwrap();
        assert!(harness.journal().contains(&"process:only:".to_string()));
    }

    #[test]
    fn test_emit_during_start_reaches_next_step() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[
            ActionConf::new("emit").with_param("count", 2i64).with_param("on_start", true),
            journal_step("sink"),
        ]));
        let mut executor = harness.build(chain);
        executor.start().unwrap();
        let journal = harness.journal();
        assert_eq!(journal[0], "process:sink:0");
        assert_eq!(journal[1], "process:sink:1");
        assert_eq!(journal[2], "start:sink");
    }

    #[test]
    fn test_output_values_reuses_scratch() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[
            ActionConf::new("emit").with_param("count", 3i64),
            journal_step("sink"),
        ]));
        let mut executor = harness.build(chain);
        executor.start().unwrap();
        executor.push(&Tuple::new()).unwrap();
        executor.stop().unwrap();
        let processed: Vec<_> = harness
            .journal()
            .into_iter()
            .filter(|e| e.starts_with("process"))
            .collect();
        assert_eq!(processed, vec!["process:sink:0", "process:sink:1", "process:sink:2"]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[journal_step("a")]));
        let mut executor = harness.build(chain);
        executor.start().unwrap();
        executor.stop().unwrap();
        executor.stop().unwrap();
        assert_eq!(harness.journal(), vec!["start:a", "stop:a"]);
        assert!(executor.is_stopped());
        assert!(executor.push(&Tuple::new()).is_err());
    }

    #[test]
    fn test_stop_runs_every_callback_after_failure() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[
            journal_step("a"),
            ActionConf::new("fail").with_param("phase", "stop"),
            journal_step("c"),
        ]));
        let mut executor = harness.build(chain);
        executor.start().unwrap();
        assert!(executor.stop().is_err());
        assert!(harness.journal().contains(&"stop:c".to_string()));
    }

    #[test]
    fn test_execute_stops_aborted_chain() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[
            ActionConf::new("fail").with_param("phase", "process"),
            journal_step("b"),
        ]));
        let executor = harness.build(chain);
        assert!(executor.execute(harness.open_dummy()).is_err());
        assert_eq!(harness.journal(), vec!["start:b", "stop:b"]);
    }

    #[test]
    fn test_principal_branch_flag() {
        let harness = Harness::local();
        let tracked = |label: &str| journal_step(label).with_param("track_principal", true);
        let parent = harness.root(seq(&[tracked("a"), tracked("b")]));
        let child = parent.derive(
            ChainId::from_raw(99),
            parent.chain_id,
            Some(&seq(&[tracked("x")])),
            Some(1),
        );
        let mut executor = harness.build(child);
        executor.start().unwrap();
        executor.push(&Tuple::new()).unwrap();
        executor.stop().unwrap();
        let flags: Vec<_> = harness
            .journal()
            .into_iter()
            .filter(|e| e.starts_with("principal:"))
            .collect();
        assert_eq!(flags, vec!["principal:x:true", "principal:b:false"]);
    }

    #[test]
    fn test_unknown_action_fails_build() {
        let harness = Harness::local();
        let chain = harness.root(seq(&[ActionConf::new("no_such_step")]));
        let err = ChainExecutor::build(chain, harness.node(), harness.dispatcher(), None).err();
        assert!(matches!(err, Some(CoreError::Usage { .. })));
    }

    #[test]
    fn test_depth_cap() {
        let harness = Harness::with_config(tributary_core::EngineConfig::local().with_max_chain_steps(2));
        let chain = harness.root(seq(&[journal_step("a"), journal_step("b"), journal_step("c")]));
        let err = ChainExecutor::build(chain, harness.node(), harness.dispatcher(), None).err();
        assert!(matches!(err, Some(CoreError::CapacityExceeded { .. })));
    }
}
