//! One engine node: chain queue, handler pool, transport endpoint and,
//! for submissions made here, completion tracking.

use crate::handler::{ChainRunner, HandlerPool, PoolStats};
use crate::queue::ChainQueue;
use crate::tracker::{ChainReport, CompletionTracker, SubmissionStatus};
use crate::transport::{MessageHandler, Transport, WireMessage};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tributary_core::{
    ActionSequence, Chain, CoreError, CoreResult, EngineConfig, InputSource, NodeId, SubmissionId,
    Value,
};
use tributary_runtime::{
    ActionRegistry, ChainDispatcher, ChainExecutor, HandlerStatus, NodeContext, SubmissionStats,
    open_input,
};
use tributary_storage::{BucketAlert, BucketShipment, CacheBroadcaster, RemoteBuckets};

/// Node errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    /// The node was shut down
    #[error("Node {0} is shut down")]
    ShutDown(NodeId),

    /// A distributed node was built without a transport
    #[error("Node {0} is distributed but has no transport")]
    NoTransport(NodeId),

    /// The submission stopped being tracked before it finished
    #[error("Submission {0} abandoned")]
    Abandoned(SubmissionId),

    /// The submission did not finish in time
    #[error("Submission {submission} still running after {elapsed:?}")]
    Timeout {
        /// Submission
        submission: SubmissionId,
        /// Time waited
        elapsed: Duration,
    },
}

impl From<NodeError> for CoreError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::ShutDown(node) => CoreError::Closed {
                resource: format!("node {}", node),
            },
            NodeError::NoTransport(_) => CoreError::InvalidConfig {
                reason: err.to_string(),
            },
            NodeError::Abandoned(_) | NodeError::Timeout { .. } => CoreError::Cancelled,
        }
    }
}

/// Handle on a submission made through [`Node::submit`]
#[derive(Debug)]
pub struct SubmissionHandle {
    id: SubmissionId,
    status: watch::Receiver<SubmissionStatus>,
}

impl SubmissionHandle {
    /// Submission ID
    #[must_use]
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SubmissionStatus {
        self.status.borrow().clone()
    }

    /// Wait until the submission completes or fails
    ///
    /// # Errors
    ///
    /// Returns error if the node stops tracking the submission first
    pub async fn wait(&mut self) -> Result<SubmissionStatus, NodeError> {
        self.status
            .wait_for(SubmissionStatus::is_finished)
            .await
            .map(|status| (*status).clone())
            .map_err(|_| NodeError::Abandoned(self.id))
    }

    /// Like [`SubmissionHandle::wait`], giving up after `timeout`
    ///
    /// # Errors
    ///
    /// Returns error on timeout or if the submission is abandoned
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<SubmissionStatus, NodeError> {
        let submission = self.id;
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| NodeError::Timeout {
                submission,
                elapsed: timeout,
            })?
    }
}

struct NodeShared {
    ctx: Arc<NodeContext>,
    queue: Arc<ChainQueue>,
    pool: HandlerPool,
    transport: Option<Arc<dyn Transport>>,
    tracker: CompletionTracker,
    next_target: AtomicU32,
    closed: AtomicBool,
    me: Weak<NodeShared>,
}

impl NodeShared {
    fn id(&self) -> NodeId {
        self.ctx.node_id()
    }

    fn enqueue(&self, chain: Chain) -> CoreResult<()> {
        let chain_id = chain.chain_id;
        self.queue.push(chain).map_err(|err| {
            tracing::warn!(node = %self.id(), chain = %chain_id, error = %err, "chain rejected");
            CoreError::from(err)
        })
    }

    fn send(&self, to: NodeId, message: &WireMessage) -> CoreResult<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(NodeError::NoTransport(self.id()))?;
        transport.send_message(self.id(), to, message)?;
        Ok(())
    }

    /// Round-robin placement of chains dispatched without a target
    fn next_target(&self) -> NodeId {
        let count = self.ctx.config().node_count.max(1);
        NodeId::new(self.next_target.fetch_add(1, Ordering::Relaxed) % count)
    }

    fn report(&self, submission_node: NodeId, report: ChainReport) -> CoreResult<()> {
        if self.ctx.is_local(submission_node) {
            self.tracker.report(report)
        } else {
            self.send(submission_node, &WireMessage::Completion(report))
        }
    }
}

impl RemoteBuckets for NodeShared {
    fn alert_bucket(&self, node: NodeId, alert: BucketAlert) -> CoreResult<()> {
        if self.ctx.is_local(node) {
            self.ctx.buckets().alert(alert)
        } else {
            self.send(node, &WireMessage::BucketAlert(alert))
        }
    }

    fn ship_bucket(&self, node: NodeId, shipment: BucketShipment) -> CoreResult<()> {
        if self.ctx.is_local(node) {
            self.ctx.buckets().deliver(shipment)
        } else {
            self.send(node, &WireMessage::BucketData(shipment))
        }
    }
}

impl CacheBroadcaster for NodeShared {
    fn broadcast_cache(&self, submission: SubmissionId, key: &str, value: &Value) -> CoreResult<()> {
        if self.ctx.is_local_mode() {
            return Ok(());
        }
        let message = WireMessage::CacheEntry {
            submission,
            key: key.to_string(),
            value: value.clone(),
        };
        for node in (0..self.ctx.config().node_count).map(NodeId::new) {
            if node != self.id() {
                self.send(node, &message)?;
            }
        }
        Ok(())
    }
}

impl ChainDispatcher for NodeShared {
    fn dispatch(&self, chain: Chain, target: Option<NodeId>) -> CoreResult<()> {
        if self.ctx.is_local_mode() {
            return self.enqueue(chain);
        }
        let target = target.unwrap_or_else(|| self.next_target());
        if target == self.id() {
            self.enqueue(chain)
        } else {
            tracing::trace!(chain = %chain.chain_id, from = %self.id(), to = %target, "chain shipped");
            self.send(target, &WireMessage::Chain(chain))
        }
    }

    fn start_separate_handler(&self, chain: Chain) -> CoreResult<()> {
        self.pool.start_separate(chain)
    }
}

impl ChainRunner for NodeShared {
    fn run_chain(&self, chain: Chain, status: &Arc<HandlerStatus>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let dispatcher: Arc<dyn ChainDispatcher> = me;
        let submission_node = chain.submission_node;
        let lineage = ChainReport::for_chain(&chain);
        let split = match &chain.input {
            InputSource::Split { split } => Some(*split),
            _ => None,
        };

        let outcome = ChainExecutor::build(
            chain,
            Arc::clone(&self.ctx),
            dispatcher,
            Some(Arc::clone(status)),
        )
        .and_then(|executor| {
            let input = open_input(executor.chain(), &self.ctx, Some(status.as_ref()))?;
            executor.execute(input)
        });

        let report = match outcome {
            Ok(summary) => ChainReport::finished(summary),
            Err(err) => {
                tracing::warn!(
                    node = %self.id(),
                    chain = %lineage.chain,
                    error = %err,
                    "chain aborted"
                );
                // An unclaimed reader would keep the producer blocked on a
                // full stream
                if let Some(split) = split {
                    drop(self.ctx.splits().take_reader(split));
                }
                lineage.failed(&err)
            }
        };
        let chain_id = report.chain;
        if let Err(err) = self.report(submission_node, report) {
            tracing::error!(
                node = %self.id(),
                chain = %chain_id,
                error = %err,
                "completion report lost"
            );
        }
    }
}

impl MessageHandler for NodeShared {
    fn handle_message(&self, from: NodeId, message: WireMessage) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::ShutDown(self.id()).into());
        }
        tracing::trace!(node = %self.id(), %from, kind = message.kind(), "message received");
        match message {
            WireMessage::Chain(chain) => self.enqueue(chain),
            WireMessage::Completion(report) => self.tracker.report(report),
            WireMessage::CacheEntry {
                submission,
                key,
                value,
            } => {
                self.ctx.cache().put(submission, key, value);
                Ok(())
            }
            WireMessage::BucketData(shipment) => self.ctx.buckets().deliver(shipment),
            WireMessage::BucketAlert(alert) => self.ctx.buckets().alert(alert),
        }
    }
}

/// A running engine node.
///
/// Handlers start on construction. In local mode every chain runs here;
/// otherwise chains, bucket data, cache entries and completion reports
/// travel through the transport.
pub struct Node {
    shared: Arc<NodeShared>,
}

impl Node {
    /// Start a node
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, a distributed node
    /// has no transport or the handlers cannot be started
    pub fn start(
        config: EngineConfig,
        registry: ActionRegistry,
        transport: Option<Arc<dyn Transport>>,
    ) -> CoreResult<Self> {
        config.validate()?;
        if !config.local_mode && transport.is_none() {
            return Err(NodeError::NoTransport(config.node_id).into());
        }

        let initial_handlers = config.initial_handlers;
        let max_handlers = config.max_handlers;
        let queue = Arc::new(ChainQueue::from_config(&config));
        let ctx = Arc::new(NodeContext::new(config, registry));
        let node_id = ctx.node_id();

        let shared = Arc::new_cyclic(|me: &Weak<NodeShared>| {
            let runner: Weak<dyn ChainRunner> = me.clone();
            NodeShared {
                pool: HandlerPool::new(node_id, Arc::clone(&queue), runner, max_handlers),
                ctx,
                queue,
                transport,
                tracker: CompletionTracker::new(),
                next_target: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                me: me.clone(),
            }
        });
        shared.pool.start(initial_handlers)?;

        tracing::info!(
            node = %node_id,
            local = shared.ctx.is_local_mode(),
            handlers = initial_handlers,
            "node started"
        );
        Ok(Self { shared })
    }

    /// Start a single-node engine with the built-in steps
    ///
    /// # Errors
    ///
    /// Returns error if the handlers cannot be started
    pub fn local() -> CoreResult<Self> {
        Self::start(EngineConfig::local(), ActionRegistry::with_builtins(), None)
    }

    /// This node
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.shared.id()
    }

    /// Node services
    #[must_use]
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.shared.ctx
    }

    /// Receiving end to attach to a transport
    #[must_use]
    pub fn message_handler(&self) -> Weak<dyn MessageHandler> {
        Arc::downgrade(&self.shared) as Weak<dyn MessageHandler>
    }

    /// Submit a chain of `actions` reading `input`; its root runs here
    ///
    /// # Errors
    ///
    /// Returns error if the node is shut down, the chain is invalid or
    /// the queue rejects it
    pub fn submit(&self, actions: &ActionSequence, input: InputSource) -> CoreResult<SubmissionHandle> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(NodeError::ShutDown(self.id()).into());
        }

        let ids = shared.ctx.ids();
        let submission = ids.next_submission_id();
        let root = Chain::root(ids.next_chain_id(), submission, self.id(), actions, input);
        root.validate(shared.ctx.config().max_chain_steps)?;

        let status = shared.tracker.register(submission, root.chain_id);
        tracing::info!(
            node = %self.id(),
            %submission,
            root = %root.chain_id,
            steps = root.len(),
            "submission accepted"
        );
        if let Err(err) = shared.enqueue(root) {
            shared.tracker.forget(submission);
            return Err(err);
        }
        Ok(SubmissionHandle {
            id: submission,
            status,
        })
    }

    /// Status of a submission made here
    #[must_use]
    pub fn status(&self, submission: SubmissionId) -> Option<SubmissionStatus> {
        self.shared.tracker.status(submission)
    }

    /// Statistics this node collected for a submission
    #[must_use]
    pub fn stats(&self, submission: SubmissionId) -> SubmissionStats {
        self.shared.ctx.stats().snapshot(submission)
    }

    /// Handler pool counters
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Drop the buckets, cache entries, statistics and tracking state of a
    /// finished submission
    pub fn cleanup(&self, submission: SubmissionId) {
        self.shared.ctx.cleanup_submission(submission);
        self.shared.ctx.stats().remove(submission);
        self.shared.tracker.forget(submission);
    }

    /// Stop the node.
    ///
    /// Blocked waits are cancelled and handlers exit once their chain
    /// returns. Calling it again does nothing.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.queue.close();
        shared.ctx.cache().close();
        shared.ctx.buckets().clear();
        shared.pool.shutdown();
        tracing::info!(node = %self.id(), "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("queued", &self.shared.queue.len())
            .field("pool", &self.shared.pool)
            .field("tracker", &self.shared.tracker)
            .finish()
    }
}
