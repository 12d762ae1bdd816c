//! Per-submission key/value cache.
//!
//! Used for synchronization tokens and small shared objects. Reads can
//! block until a key appears, which makes a put act as a level-triggered
//! signal: readers arriving after the put return immediately.

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::Duration;
use tributary_core::{CoreError, CoreResult, SubmissionId, Value};

/// Prefix of the cache keys backing synchronization tokens
pub const SYNC_TOKEN_PREFIX: &str = "synchronization_token";

/// Cache key of a synchronization token
#[must_use]
pub fn sync_token_key(token: i32) -> String {
    format!("{}_{}", SYNC_TOKEN_PREFIX, token)
}

/// Replication of cache entries to the other nodes
pub trait CacheBroadcaster: Send + Sync {
    /// Send one entry to every other node
    ///
    /// # Errors
    ///
    /// Returns error if the entry cannot be delivered
    fn broadcast_cache(&self, submission: SubmissionId, key: &str, value: &Value) -> CoreResult<()>;
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<SubmissionId, IndexMap<String, Value>>,
    closed: bool,
}

/// Submission cache of one node
#[derive(Debug, Default)]
pub struct SubmissionCache {
    inner: Mutex<CacheInner>,
    changed: Condvar,
}

impl SubmissionCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry, waking blocked readers
    pub fn put(&self, submission: SubmissionId, key: impl Into<String>, value: Value) {
        let mut inner = self.inner.lock();
        inner
            .entries
            .entry(submission)
            .or_default()
            .insert(key.into(), value);
        self.changed.notify_all();
    }

    /// Read an entry
    #[must_use]
    pub fn get(&self, submission: SubmissionId, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .entries
            .get(&submission)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    /// Block until an entry exists, then read it
    ///
    /// # Errors
    ///
    /// Returns error if the cache is closed while waiting
    pub fn get_blocking(&self, submission: SubmissionId, key: &str) -> CoreResult<Value> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = Self::lookup(&inner, submission, key) {
                return Ok(value);
            }
            if inner.closed {
                return Err(CoreError::Cancelled);
            }
            self.changed.wait(&mut inner);
        }
    }

    /// Like [`SubmissionCache::get_blocking`], giving up after `timeout`
    ///
    /// # Errors
    ///
    /// Returns error if the cache is closed while waiting
    pub fn get_timeout(
        &self,
        submission: SubmissionId,
        key: &str,
        timeout: Duration,
    ) -> CoreResult<Option<Value>> {
        let mut inner = self.inner.lock();
        self.changed.wait_while_for(
            &mut inner,
            |i| !i.closed && Self::lookup(i, submission, key).is_none(),
            timeout,
        );
        match Self::lookup(&inner, submission, key) {
            Some(value) => Ok(Some(value)),
            None if inner.closed => Err(CoreError::Cancelled),
            None => Ok(None),
        }
    }

    /// Remove an entry
    pub fn remove(&self, submission: SubmissionId, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .entries
            .get_mut(&submission)
            .and_then(|entries| entries.shift_remove(key))
    }

    /// Keys of a submission, in insertion order
    #[must_use]
    pub fn keys(&self, submission: SubmissionId) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .get(&submission)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every entry of a submission
    pub fn clear_submission(&self, submission: SubmissionId) {
        self.inner.lock().entries.remove(&submission);
    }

    /// Fail every current and future blocking read
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.changed.notify_all();
    }

    fn lookup(inner: &CacheInner, submission: SubmissionId, key: &str) -> Option<Value> {
        inner
            .entries
            .get(&submission)
            .and_then(|entries| entries.get(key))
            .cloned()
    }
}
