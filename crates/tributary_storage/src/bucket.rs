//! Record containers used to shuffle data between chains.
//!
//! A bucket accumulates tuples from any number of writers and becomes
//! readable once it is sealed. Sealing is driven by writer accounting:
//! the principal writer reports how many further writers (its children)
//! are still expected, every other writer reports itself done, and the
//! bucket seals once the principal finished and nobody is outstanding.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tributary_core::{BucketId, ChainId, CoreError, CoreResult, CounterDeltas, SubmissionId, Tuple};

/// Lifecycle of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketState {
    /// Writers may still add tuples
    Accumulating,
    /// Contents are final and readable
    Sealed,
    /// Submission cleaned up; contents dropped
    Removed,
}

/// Contribution of one writer, sent when it finishes its transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterReport {
    /// Writing chain
    pub chain: Option<ChainId>,
    /// Further writers this writer spawned
    pub children: i32,
    /// Whether the writer is the principal owner of the writing step
    pub principal: bool,
    /// Whether this writer counts itself done
    pub decrease_counter: bool,
    /// Counter deltas handed over to whoever reads the bucket
    pub deltas: CounterDeltas,
}

impl WriterReport {
    /// Report of the principal writer
    #[must_use]
    pub fn principal(chain: ChainId, children: i32) -> Self {
        Self {
            chain: Some(chain),
            children,
            principal: true,
            decrease_counter: false,
            deltas: CounterDeltas::new(),
        }
    }

    /// Report of a secondary writer that counts itself done
    #[must_use]
    pub fn secondary(chain: ChainId, children: i32) -> Self {
        Self {
            chain: Some(chain),
            children,
            principal: false,
            decrease_counter: true,
            deltas: CounterDeltas::new(),
        }
    }

    /// Attach forwarded counter deltas
    #[must_use]
    pub fn with_deltas(mut self, deltas: CounterDeltas) -> Self {
        self.deltas = deltas;
        self
    }
}

/// Tuples written to a remote bucket plus the writer's report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketShipment {
    /// Owning submission
    pub submission: SubmissionId,
    /// Target bucket
    pub bucket: BucketId,
    /// Sort key, if the bucket is sorted
    pub sort: Option<Vec<usize>>,
    /// Tuples written
    pub tuples: Vec<Tuple>,
    /// Writer accounting
    pub writer: WriterReport,
}

/// Notice that a writer is about to transfer data to a bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketAlert {
    /// Owning submission
    pub submission: SubmissionId,
    /// Target bucket
    pub bucket: BucketId,
    /// Sort key, if the bucket is sorted
    pub sort: Option<Vec<usize>>,
}

/// What a reader gets from a sealed bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketContents {
    /// Tuples, sorted if the bucket has a sort key
    pub tuples: Vec<Tuple>,
    /// Counter deltas forwarded by writers; handed to the first reader only
    pub deltas: CounterDeltas,
}

#[derive(Debug)]
struct BucketInner {
    sort: Option<Vec<usize>>,
    tuples: Vec<Tuple>,
    pending_writers: i64,
    principal_finished: bool,
    state: BucketState,
    deltas: CounterDeltas,
}

/// Per-submission record container
#[derive(Debug)]
pub struct Bucket {
    submission: SubmissionId,
    id: BucketId,
    inner: Mutex<BucketInner>,
    sealed: Condvar,
}

impl Bucket {
    /// Create an empty accumulating bucket
    #[must_use]
    pub fn new(submission: SubmissionId, id: BucketId, sort: Option<Vec<usize>>) -> Self {
        Self {
            submission,
            id,
            inner: Mutex::new(BucketInner {
                sort,
                tuples: Vec::new(),
                pending_writers: 0,
                principal_finished: false,
                state: BucketState::Accumulating,
                deltas: CounterDeltas::new(),
            }),
            sealed: Condvar::new(),
        }
    }

    /// Bucket ID
    #[must_use]
    pub fn id(&self) -> BucketId {
        self.id
    }

    /// Owning submission
    #[must_use]
    pub fn submission(&self) -> SubmissionId {
        self.submission
    }

    /// Sort key
    #[must_use]
    pub fn sort(&self) -> Option<Vec<usize>> {
        self.inner.lock().sort.clone()
    }

    /// Take on a sort key if the bucket has none yet; returns whether the
    /// bucket now sorts on `fields`
    pub fn adopt_sort(&self, fields: &[usize]) -> bool {
        let mut inner = self.inner.lock();
        if let Some(existing) = &inner.sort {
            return existing == fields;
        }
        if inner.state != BucketState::Accumulating {
            return false;
        }
        inner.sort = Some(fields.to_vec());
        true
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> BucketState {
        self.inner.lock().state
    }

    /// Number of tuples stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().tuples.len()
    }

    /// Whether no tuple is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writers still expected to report
    #[must_use]
    pub fn pending_writers(&self) -> i64 {
        self.inner.lock().pending_writers
    }

    /// Add one tuple
    ///
    /// # Errors
    ///
    /// Returns error if the bucket is no longer accumulating
    pub fn add(&self, tuple: Tuple) -> CoreResult<()> {
        self.add_all(std::iter::once(tuple))
    }

    /// Add many tuples
    ///
    /// # Errors
    ///
    /// Returns error if the bucket is no longer accumulating
    pub fn add_all(&self, tuples: impl IntoIterator<Item = Tuple>) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        self.check_accumulating(&inner)?;
        inner.tuples.extend(tuples);
        Ok(())
    }

    /// Account for a finished writer; returns whether the bucket sealed
    ///
    /// # Errors
    ///
    /// Returns error if the bucket is no longer accumulating
    pub fn finish_writer(&self, report: WriterReport) -> CoreResult<bool> {
        let mut inner = self.inner.lock();
        self.check_accumulating(&inner)?;

        inner.pending_writers += i64::from(report.children);
        if report.principal {
            inner.principal_finished = true;
        } else if report.decrease_counter {
            inner.pending_writers -= 1;
        }
        inner.deltas.merge(report.deltas);

        if inner.principal_finished && inner.pending_writers == 0 {
            self.seal_locked(&mut inner);
            return Ok(true);
        }
        Ok(false)
    }

    /// Seal regardless of writer accounting
    pub fn seal(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BucketState::Accumulating {
            self.seal_locked(&mut inner);
        }
    }

    /// Drop the contents and wake every waiting reader
    pub fn remove(&self) {
        let mut inner = self.inner.lock();
        inner.state = BucketState::Removed;
        inner.tuples = Vec::new();
        inner.deltas = CounterDeltas::new();
        self.sealed.notify_all();
    }

    /// Block until the bucket is sealed, then read it
    ///
    /// # Errors
    ///
    /// Returns error if the bucket is removed while waiting
    pub fn wait_sealed(&self) -> CoreResult<BucketContents> {
        let mut inner = self.inner.lock();
        while inner.state == BucketState::Accumulating {
            self.sealed.wait(&mut inner);
        }
        self.read_locked(&mut inner)
    }

    /// Like [`Bucket::wait_sealed`], giving up after `timeout`
    ///
    /// # Errors
    ///
    /// Returns error if the bucket is removed while waiting
    pub fn wait_sealed_timeout(&self, timeout: Duration) -> CoreResult<Option<BucketContents>> {
        let mut inner = self.inner.lock();
        if inner.state == BucketState::Accumulating {
            let result = self
                .sealed
                .wait_while_for(&mut inner, |i| i.state == BucketState::Accumulating, timeout);
            if result.timed_out() {
                return Ok(None);
            }
        }
        self.read_locked(&mut inner).map(Some)
    }

    fn check_accumulating(&self, inner: &BucketInner) -> CoreResult<()> {
        match inner.state {
            BucketState::Accumulating => Ok(()),
            BucketState::Sealed => Err(CoreError::Closed {
                resource: format!("{} of {}", self.id, self.submission),
            }),
            BucketState::Removed => Err(CoreError::Cancelled),
        }
    }

    fn seal_locked(&self, inner: &mut BucketInner) {
        let BucketInner { sort, tuples, .. } = &mut *inner;
        match sort {
            Some(fields) if fields.is_empty() => tuples.sort(),
            Some(fields) => tuples.sort_by(|a, b| a.cmp_fields(b, fields)),
            None => {}
        }
        inner.state = BucketState::Sealed;
        tracing::debug!(
            bucket = %self.id,
            submission = %self.submission,
            tuples = inner.tuples.len(),
            "bucket sealed"
        );
        self.sealed.notify_all();
    }

    fn read_locked(&self, inner: &mut BucketInner) -> CoreResult<BucketContents> {
        match inner.state {
            BucketState::Sealed => Ok(BucketContents {
                tuples: inner.tuples.clone(),
                deltas: inner.deltas.take(),
            }),
            _ => Err(CoreError::Cancelled),
        }
    }
}
