//! Bounded queue of chains waiting for a handler.

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tributary_core::{Chain, CoreError, EngineConfig, OverflowPolicy};

/// How long a blocked producer sleeps before re-checking for shutdown
const BLOCKED_SEND_POLL: Duration = Duration::from_millis(50);

/// Queue errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Queue full under the reject policy
    #[error("Chain queue full: {capacity} chains")]
    Full {
        /// Queue capacity
        capacity: usize,
    },

    /// Queue closed
    #[error("Chain queue closed")]
    Closed,
}

impl From<QueueError> for CoreError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full { capacity } => CoreError::CapacityExceeded {
                resource: "chain queue".to_string(),
                limit: capacity as u64,
            },
            QueueError::Closed => CoreError::Closed {
                resource: "chain queue".to_string(),
            },
        }
    }
}

/// Chains of one node waiting to run
#[derive(Debug)]
pub struct ChainQueue {
    tx: Sender<Chain>,
    rx: Receiver<Chain>,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
}

impl ChainQueue {
    /// Create a queue
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            policy,
            closed: AtomicBool::new(false),
        }
    }

    /// Create the queue described by a node configuration
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.queue_capacity, config.overflow_policy)
    }

    /// Queue a chain.
    ///
    /// Under [`OverflowPolicy::Reject`] a full queue fails immediately;
    /// under [`OverflowPolicy::Block`] the caller waits for space.
    ///
    /// # Errors
    ///
    /// Returns error if the queue is full (reject policy) or closed
    pub fn push(&self, chain: Chain) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        match self.policy {
            OverflowPolicy::Reject => self.tx.try_send(chain).map_err(|err| match err {
                TrySendError::Full(_) => QueueError::Full {
                    capacity: self.capacity,
                },
                TrySendError::Disconnected(_) => QueueError::Closed,
            }),
            OverflowPolicy::Block => {
                let mut chain = chain;
                loop {
                    match self.tx.send_timeout(chain, BLOCKED_SEND_POLL) {
                        Ok(()) => return Ok(()),
                        Err(SendTimeoutError::Timeout(back)) => {
                            if self.is_closed() {
                                return Err(QueueError::Closed);
                            }
                            chain = back;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => return Err(QueueError::Closed),
                    }
                }
            }
        }
    }

    /// Take the next chain, waiting at most `timeout`
    ///
    /// # Errors
    ///
    /// Returns error once the queue is closed and drained
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<Chain>, QueueError> {
        match self.rx.recv_timeout(timeout) {
            Ok(chain) => Ok(Some(chain)),
            Err(RecvTimeoutError::Timeout) if self.is_closed() => Err(QueueError::Closed),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Closed),
        }
    }

    /// Chains waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no chain is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of waiting chains
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting chains; consumers drain what is left
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the queue was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tributary_core::{ActionConf, ActionSequence, ChainId, InputSource, NodeId, SubmissionId};

    fn chain(id: u64) -> Chain {
        Chain::root(
            ChainId::from_raw(id),
            SubmissionId::new(1),
            NodeId::new(0),
            &ActionSequence::new().then(ActionConf::new("a")),
            InputSource::Dummy,
        )
    }

    #[test]
    fn test_fifo() {
        let queue = ChainQueue::new(4, OverflowPolicy::Reject);
        queue.push(chain(1)).unwrap();
        queue.push(chain(2)).unwrap();
        assert_eq!(queue.len(), 2);
        let first = queue.pop_timeout(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(first.chain_id, ChainId::from_raw(1));
    }

    #[test]
    fn test_reject_when_full() {
        let queue = ChainQueue::new(1, OverflowPolicy::Reject);
        queue.push(chain(1)).unwrap();
        let err = queue.push(chain(2)).unwrap_err();
        assert_eq!(err, QueueError::Full { capacity: 1 });
        assert!(CoreError::from(err).is_capacity());
    }

    #[test]
    fn test_block_waits_for_space() {
        let queue = Arc::new(ChainQueue::new(1, OverflowPolicy::Block));
        queue.push(chain(1)).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(chain(2)))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);

        queue.pop_timeout(Duration::from_millis(10)).unwrap();
        producer.join().unwrap().unwrap();
        let second = queue.pop_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(second.chain_id, ChainId::from_raw(2));
    }

    #[test]
    fn test_close() {
        let queue = ChainQueue::new(2, OverflowPolicy::Block);
        queue.push(chain(1)).unwrap();
        queue.close();
        assert_eq!(queue.push(chain(2)), Err(QueueError::Closed));
        // Drains before reporting closed
        assert!(queue.pop_timeout(Duration::from_millis(1)).unwrap().is_some());
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), Err(QueueError::Closed));
    }
}
