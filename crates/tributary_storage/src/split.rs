//! Split streams: bounded hand-off channels between two chains on a node.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tributary_core::{CoreError, CoreResult, SplitId, Tuple};

/// Producer side of a split stream.
///
/// Clones share the stream; closing any clone closes it for all.
#[derive(Debug, Clone)]
pub struct SplitWriter {
    id: SplitId,
    sender: Arc<Mutex<Option<Sender<Tuple>>>>,
}

impl SplitWriter {
    /// Stream ID
    #[must_use]
    pub fn id(&self) -> SplitId {
        self.id
    }

    /// Send a tuple, blocking while the buffer is full
    ///
    /// # Errors
    ///
    /// Returns error if the stream is closed or the reader is gone
    pub fn send(&self, tuple: Tuple) -> CoreResult<()> {
        let sender = self.sender.lock().clone();
        let closed = || CoreError::Closed {
            resource: self.id.to_string(),
        };
        sender.ok_or_else(closed)?.send(tuple).map_err(|_| closed())
    }

    /// Close the stream; the reader sees end of input once drained
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            tracing::trace!(split = %self.id, "split stream closed");
        }
    }

    /// Whether the stream was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Consumer side of a split stream
#[derive(Debug)]
pub struct SplitReader {
    id: SplitId,
    receiver: Receiver<Tuple>,
}

impl SplitReader {
    /// Stream ID
    #[must_use]
    pub fn id(&self) -> SplitId {
        self.id
    }

    /// Next tuple, blocking until one arrives; `None` once closed and drained
    pub fn next_tuple(&self) -> Option<Tuple> {
        self.receiver.recv().ok()
    }
}

/// Registry of the split streams opened on a node
#[derive(Debug)]
pub struct SplitRegistry {
    capacity: usize,
    next_id: AtomicU64,
    readers: Mutex<HashMap<SplitId, SplitReader>>,
}

impl SplitRegistry {
    /// Create a registry whose streams buffer `capacity` tuples
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new stream; its reader waits here until claimed
    #[must_use]
    pub fn register(&self) -> SplitWriter {
        let id = SplitId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = crossbeam_channel::bounded(self.capacity);
        self.readers.lock().insert(id, SplitReader { id, receiver });
        SplitWriter {
            id,
            sender: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Claim the reader of a stream
    ///
    /// # Errors
    ///
    /// Returns error if the stream does not exist or was already claimed
    pub fn take_reader(&self, id: SplitId) -> CoreResult<SplitReader> {
        self.readers.lock().remove(&id).ok_or_else(|| CoreError::NotFound {
            kind: "Split".to_string(),
            id: id.to_string(),
        })
    }

    /// Streams registered but not yet claimed
    #[must_use]
    pub fn unclaimed(&self) -> usize {
        self.readers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::Value;

    fn int(v: i32) -> Tuple {
        Tuple::from_values(vec![Value::Int(v)])
    }

    #[test]
    fn test_stream_delivers_in_order() {
        let registry = SplitRegistry::new(4);
        let writer = registry.register();
        let reader = registry.take_reader(writer.id()).unwrap();
        assert_eq!(registry.unclaimed(), 0);

        writer.send(int(1)).unwrap();
        writer.send(int(2)).unwrap();
        writer.close();

        assert_eq!(reader.next_tuple(), Some(int(1)));
        assert_eq!(reader.next_tuple(), Some(int(2)));
        assert_eq!(reader.next_tuple(), None);
    }

    #[test]
    fn test_close_is_idempotent() {
        let registry = SplitRegistry::new(1);
        let writer = registry.register();
        let clone = writer.clone();
        writer.close();
        clone.close();
        assert!(writer.is_closed());
        assert!(matches!(clone.send(int(1)), Err(CoreError::Closed { .. })));
    }

    #[test]
    fn test_reader_claimed_once() {
        let registry = SplitRegistry::new(1);
        let writer = registry.register();
        assert!(registry.take_reader(writer.id()).is_ok());
        assert!(registry.take_reader(writer.id()).is_err());
    }

    #[test]
    fn test_producer_blocks_until_consumed() {
        let registry = SplitRegistry::new(1);
        let writer = registry.register();
        let reader = registry.take_reader(writer.id()).unwrap();

        let producer = std::thread::spawn(move || {
            for v in 0..10 {
                writer.send(int(v)).unwrap();
            }
            writer.close();
        });

        let mut received = Vec::new();
        while let Some(t) = reader.next_tuple() {
            received.push(t);
        }
        producer.join().unwrap();
        assert_eq!(received.len(), 10);
    }

    #[test]
    fn test_send_after_reader_dropped() {
        let registry = SplitRegistry::new(1);
        let writer = registry.register();
        drop(registry.take_reader(writer.id()).unwrap());
        assert!(writer.send(int(1)).is_err());
    }
}
