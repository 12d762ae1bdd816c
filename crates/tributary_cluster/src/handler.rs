//! Handler threads running queued chains.
//!
//! Each handler pulls a chain from the node's queue and runs it to the
//! end on its own thread. A chain blocked on a bucket or a
//! synchronization token keeps its handler; when every handler is
//! blocked and chains are waiting, the supervisor starts one more, up to
//! `max_handlers`. Split consumers get a dedicated thread so they can
//! never be starved by their producer.

use crate::queue::{ChainQueue, QueueError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tributary_core::{Chain, CoreError, CoreResult, NodeId};
use tributary_runtime::{HandlerState, HandlerStatus};

const QUEUE_POLL: Duration = Duration::from_millis(20);
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(10);

/// Runs one chain to completion on the calling handler thread
pub trait ChainRunner: Send + Sync + 'static {
    /// Execute a chain and report its outcome
    fn run_chain(&self, chain: Chain, status: &Arc<HandlerStatus>);
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Handlers started, extra handlers included
    pub handlers: usize,
    /// Handlers started because every other one was blocked
    pub extra_handlers: usize,
    /// Dedicated split handlers started
    pub split_handlers: usize,
    /// Chains run to the end
    pub chains_run: u64,
}

struct Handler {
    status: Arc<HandlerStatus>,
    join: JoinHandle<()>,
}

struct PoolShared {
    node: NodeId,
    queue: Arc<ChainQueue>,
    runner: Weak<dyn ChainRunner>,
    max_handlers: usize,
    handlers: Mutex<Vec<Handler>>,
    separate: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
    extra_handlers: AtomicUsize,
    split_handlers: AtomicUsize,
    chains_run: AtomicU64,
}

/// Handler threads of one node
pub struct HandlerPool {
    shared: Arc<PoolShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl HandlerPool {
    /// Create a pool feeding `runner` from `queue`; no thread runs yet
    #[must_use]
    pub fn new(
        node: NodeId,
        queue: Arc<ChainQueue>,
        runner: Weak<dyn ChainRunner>,
        max_handlers: usize,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                node,
                queue,
                runner,
                max_handlers,
                handlers: Mutex::new(Vec::new()),
                separate: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
                extra_handlers: AtomicUsize::new(0),
                split_handlers: AtomicUsize::new(0),
                chains_run: AtomicU64::new(0),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Start `initial` handlers and the supervisor
    ///
    /// # Errors
    ///
    /// Returns error if a thread cannot be spawned
    pub fn start(&self, initial: usize) -> CoreResult<()> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return Err(CoreError::usage("start", "handler pool already started"));
        }
        for _ in 0..initial.max(1) {
            spawn_handler(&self.shared)?;
        }

        let shared = Arc::clone(&self.shared);
        let join = std::thread::Builder::new()
            .name(format!("tributary-{}-supervisor", self.shared.node))
            .spawn(move || supervise(&shared))
            .map_err(|err| CoreError::Internal {
                message: format!("failed to spawn supervisor: {}", err),
            })?;
        *supervisor = Some(join);
        tracing::debug!(node = %self.shared.node, handlers = initial.max(1), "handler pool started");
        Ok(())
    }

    /// Run a chain on a dedicated thread, outside the queue
    ///
    /// # Errors
    ///
    /// Returns error if the pool is shut down or the thread cannot be
    /// spawned
    pub fn start_separate(&self, chain: Chain) -> CoreResult<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(QueueError::Closed.into());
        }
        let n = self.shared.split_handlers.fetch_add(1, Ordering::Relaxed);
        let name = format!("tributary-{}-split-{}", self.shared.node, n);
        let status = Arc::new(HandlerStatus::new(name.clone()));
        let shared = Arc::clone(&self.shared);
        let join = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                status.set_active();
                run_one(&shared, chain, &status);
                status.set(HandlerState::Idle);
            })
            .map_err(|err| CoreError::Internal {
                message: format!("failed to spawn split handler: {}", err),
            })?;

        let mut separate = self.shared.separate.lock();
        separate.retain(|handle| !handle.is_finished());
        separate.push(join);
        Ok(())
    }

    /// Number of queue handlers
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.shared.handlers.lock().len()
    }

    /// Queue handlers blocked inside a chain
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.shared
            .handlers
            .lock()
            .iter()
            .filter(|h| h.status.state() == HandlerState::Waiting)
            .count()
    }

    /// Pool counters
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            handlers: self.handler_count(),
            extra_handlers: self.shared.extra_handlers.load(Ordering::Relaxed),
            split_handlers: self.shared.split_handlers.load(Ordering::Relaxed),
            chains_run: self.shared.chains_run.load(Ordering::Relaxed),
        }
    }

    /// Stop every thread once the chains they run return.
    ///
    /// The queue is closed first; chains still queued are drained.
    /// Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.queue.close();

        if let Some(supervisor) = self.supervisor.lock().take() {
            let _ = supervisor.join();
        }
        let handlers = std::mem::take(&mut *self.shared.handlers.lock());
        for handler in handlers {
            let _ = handler.join.join();
        }
        let separate = std::mem::take(&mut *self.shared.separate.lock());
        for join in separate {
            let _ = join.join();
        }
        tracing::debug!(node = %self.shared.node, "handler pool stopped");
    }
}

impl std::fmt::Debug for HandlerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerPool")
            .field("node", &self.shared.node)
            .field("stats", &self.stats())
            .finish()
    }
}

fn spawn_handler(shared: &Arc<PoolShared>) -> CoreResult<()> {
    let mut handlers = shared.handlers.lock();
    let name = format!("tributary-{}-handler-{}", shared.node, handlers.len());
    let status = Arc::new(HandlerStatus::new(name.clone()));
    let join = {
        let shared = Arc::clone(shared);
        let status = Arc::clone(&status);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || handler_loop(&shared, &status))
            .map_err(|err| CoreError::Internal {
                message: format!("failed to spawn handler: {}", err),
            })?
    };
    handlers.push(Handler { status, join });
    Ok(())
}

fn handler_loop(shared: &PoolShared, status: &Arc<HandlerStatus>) {
    loop {
        match shared.queue.pop_timeout(QUEUE_POLL) {
            Ok(Some(chain)) => {
                status.set_active();
                run_one(shared, chain, status);
                status.set(HandlerState::Idle);
            }
            Ok(None) => {}
            Err(_) => break,
        }
    }
    tracing::trace!(handler = status.name(), "handler exits");
}

fn run_one(shared: &PoolShared, chain: Chain, status: &Arc<HandlerStatus>) {
    match shared.runner.upgrade() {
        Some(runner) => {
            runner.run_chain(chain, status);
            shared.chains_run.fetch_add(1, Ordering::Relaxed);
        }
        None => {
            tracing::warn!(chain = %chain.chain_id, "node is gone, chain dropped");
        }
    }
}

fn supervise(shared: &Arc<PoolShared>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        std::thread::sleep(SUPERVISE_INTERVAL);
        if shared.queue.is_empty() {
            continue;
        }

        let (count, all_waiting) = {
            let handlers = shared.handlers.lock();
            let all_waiting = handlers
                .iter()
                .all(|h| h.status.state() == HandlerState::Waiting);
            (handlers.len(), all_waiting)
        };
        if !all_waiting {
            continue;
        }
        if count >= shared.max_handlers {
            tracing::warn!(
                node = %shared.node,
                handlers = count,
                queued = shared.queue.len(),
                "every handler is blocked and the pool is at its limit"
            );
            continue;
        }

        match spawn_handler(shared) {
            Ok(()) => {
                shared.extra_handlers.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(node = %shared.node, handlers = count + 1, "extra handler started");
            }
            Err(err) => tracing::error!(node = %shared.node, error = %err, "cannot start extra handler"),
        }
    }
}
