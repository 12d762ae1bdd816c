//! Node-wide services shared by every executor on a node.

use crate::monitor::StatisticsCollector;
use crate::registry::ActionRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use tributary_core::{BucketId, Chain, ChainId, CoreResult, EngineConfig, NodeId, SubmissionId};
use tributary_storage::{BucketStore, CacheBroadcaster, RemoteBuckets, SplitRegistry, SubmissionCache};

/// Allocated bucket IDs start above this, leaving lower IDs to submitters
const ALLOCATED_BUCKET_BASE: u32 = 1 << 23;

/// Hands chains created at runtime to the execution layer
pub trait ChainDispatcher: RemoteBuckets + CacheBroadcaster {
    /// Queue a chain on `target`, or wherever the dispatcher sees fit
    ///
    /// # Errors
    ///
    /// Returns error if the chain cannot be queued or sent
    fn dispatch(&self, chain: Chain, target: Option<NodeId>) -> CoreResult<()>;

    /// Run a chain on a handler of its own on this node
    ///
    /// # Errors
    ///
    /// Returns error if the handler cannot be started
    fn start_separate_handler(&self, chain: Chain) -> CoreResult<()>;
}

/// What a chain handler is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerState {
    /// Waiting for a chain
    Idle = 0,
    /// Running a chain
    Active = 1,
    /// Blocked inside a chain, on a token or a bucket
    Waiting = 2,
}

/// Shared, lock-free view of a handler's state
#[derive(Debug)]
pub struct HandlerStatus {
    name: String,
    state: AtomicU8,
}

impl HandlerStatus {
    /// Create an idle status
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(HandlerState::Idle as u8),
        }
    }

    /// Handler name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> HandlerState {
        match self.state.load(Ordering::Acquire) {
            1 => HandlerState::Active,
            2 => HandlerState::Waiting,
            _ => HandlerState::Idle,
        }
    }

    /// Set the state
    pub fn set(&self, state: HandlerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Mark blocked
    pub fn set_waiting(&self) {
        self.set(HandlerState::Waiting);
    }

    /// Mark running
    pub fn set_active(&self) {
        self.set(HandlerState::Active);
    }
}

/// Identifier allocation for one node.
///
/// Every ID embeds the node index so nodes never hand out the same value.
#[derive(Debug)]
pub struct IdAllocator {
    node: NodeId,
    next_chain: AtomicU64,
    next_submission: AtomicU32,
    next_bucket: Mutex<HashMap<SubmissionId, u32>>,
}

impl IdAllocator {
    /// Create an allocator for `node`
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            next_chain: AtomicU64::new(1),
            next_submission: AtomicU32::new(1),
            next_bucket: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh chain ID
    pub fn next_chain_id(&self) -> ChainId {
        ChainId::from_parts(self.node, self.next_chain.fetch_add(1, Ordering::Relaxed))
    }

    /// Fresh submission ID
    pub fn next_submission_id(&self) -> SubmissionId {
        let seq = self.next_submission.fetch_add(1, Ordering::Relaxed) & 0xF_FFFF;
        SubmissionId::new((self.node.as_u32() << 20) | seq)
    }

    /// Fresh bucket ID within a submission
    pub fn next_bucket_id(&self, submission: SubmissionId) -> BucketId {
        let mut buckets = self.next_bucket.lock();
        let seq = buckets.entry(submission).or_insert(0);
        *seq += 1;
        BucketId::new(ALLOCATED_BUCKET_BASE | (self.node.as_u32() << 16) | (*seq & 0xFFFF))
    }

    /// Forget a submission's bucket sequence
    pub fn release(&self, submission: SubmissionId) {
        self.next_bucket.lock().remove(&submission);
    }
}

/// Services of one node: configuration, registry, storage and statistics
#[derive(Debug)]
pub struct NodeContext {
    config: EngineConfig,
    registry: Arc<ActionRegistry>,
    buckets: Arc<BucketStore>,
    cache: Arc<SubmissionCache>,
    splits: Arc<SplitRegistry>,
    stats: Arc<StatisticsCollector>,
    ids: IdAllocator,
}

impl NodeContext {
    /// Create the services of the node described by `config`
    #[must_use]
    pub fn new(config: EngineConfig, registry: ActionRegistry) -> Self {
        Self {
            ids: IdAllocator::new(config.node_id),
            splits: Arc::new(SplitRegistry::new(config.split_capacity)),
            registry: Arc::new(registry),
            buckets: Arc::new(BucketStore::new()),
            cache: Arc::new(SubmissionCache::new()),
            stats: Arc::new(StatisticsCollector::new()),
            config,
        }
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// This node
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Whether the node runs without a network layer
    #[must_use]
    pub fn is_local_mode(&self) -> bool {
        self.config.local_mode
    }

    /// Whether `node` is served by this node's storage
    #[must_use]
    pub fn is_local(&self, node: NodeId) -> bool {
        self.config.local_mode || node == self.config.node_id
    }

    /// Action registry
    #[must_use]
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Bucket store
    #[must_use]
    pub fn buckets(&self) -> &Arc<BucketStore> {
        &self.buckets
    }

    /// Submission cache
    #[must_use]
    pub fn cache(&self) -> &Arc<SubmissionCache> {
        &self.cache
    }

    /// Split stream registry
    #[must_use]
    pub fn splits(&self) -> &Arc<SplitRegistry> {
        &self.splits
    }

    /// Statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<StatisticsCollector> {
        &self.stats
    }

    /// ID allocation
    #[must_use]
    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    /// Drop every bucket and cache entry of a submission on this node
    pub fn cleanup_submission(&self, submission: SubmissionId) {
        let removed = self.buckets.remove_submission(submission);
        self.cache.clear_submission(submission);
        self.ids.release(submission);
        tracing::debug!(%submission, buckets = removed, "submission cleaned up");
    }
}
