//! Per-node bucket store.

use crate::bucket::{Bucket, BucketAlert, BucketShipment};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tributary_core::{BucketId, CoreError, CoreResult, NodeId, SubmissionId};

/// Store error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketError {
    /// Bucket not found
    NotFound {
        /// Submission
        submission: SubmissionId,
        /// Bucket
        bucket: BucketId,
    },
    /// Bucket requested with a different sort key than it was created with
    SortMismatch {
        /// Bucket
        bucket: BucketId,
    },
}

impl std::fmt::Display for BucketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { submission, bucket } => {
                write!(f, "Bucket not found: {} of {}", bucket, submission)
            }
            Self::SortMismatch { bucket } => {
                write!(f, "Bucket {} already exists with another sort key", bucket)
            }
        }
    }
}

impl std::error::Error for BucketError {}

impl From<BucketError> for CoreError {
    fn from(err: BucketError) -> Self {
        match err {
            BucketError::NotFound { submission, bucket } => CoreError::NotFound {
                kind: "Bucket".to_string(),
                id: format!("{} of {}", bucket, submission),
            },
            BucketError::SortMismatch { .. } => CoreError::Validation {
                field: "sort".to_string(),
                reason: err.to_string(),
            },
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Buckets currently held
    pub bucket_count: usize,
    /// Tuples received through shipments
    pub tuples_received: u64,
    /// Shipments applied
    pub shipments: u64,
    /// Buckets sealed by writer accounting
    pub sealed: u64,
}

/// Delivery of bucket traffic to other nodes
pub trait RemoteBuckets: Send + Sync {
    /// Tell `node` that data for a bucket is coming
    ///
    /// # Errors
    ///
    /// Returns error if the notice cannot be delivered
    fn alert_bucket(&self, node: NodeId, alert: BucketAlert) -> CoreResult<()>;

    /// Ship written tuples and the writer's report to `node`
    ///
    /// # Errors
    ///
    /// Returns error if the shipment cannot be delivered
    fn ship_bucket(&self, node: NodeId, shipment: BucketShipment) -> CoreResult<()>;
}

/// In-memory buckets of every submission running on this node
#[derive(Debug, Default)]
pub struct BucketStore {
    buckets: RwLock<HashMap<(SubmissionId, BucketId), Arc<Bucket>>>,
    stats: Mutex<StoreStats>,
}

impl BucketStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a bucket, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns error if the bucket exists with a different sort key
    pub fn get_or_create(
        &self,
        submission: SubmissionId,
        bucket: BucketId,
        sort: Option<Vec<usize>>,
    ) -> CoreResult<Arc<Bucket>> {
        if let Some(existing) = self.buckets.read().get(&(submission, bucket)) {
            return Self::check_sort(existing, sort.as_deref());
        }

        let mut buckets = self.buckets.write();
        let entry = buckets
            .entry((submission, bucket))
            .or_insert_with(|| Arc::new(Bucket::new(submission, bucket, sort.clone())));
        let result = Self::check_sort(entry, sort.as_deref());
        self.stats.lock().bucket_count = buckets.len();
        result
    }

    /// Get an existing bucket
    ///
    /// # Errors
    ///
    /// Returns error if the bucket does not exist
    pub fn get(&self, submission: SubmissionId, bucket: BucketId) -> CoreResult<Arc<Bucket>> {
        self.buckets
            .read()
            .get(&(submission, bucket))
            .cloned()
            .ok_or_else(|| BucketError::NotFound { submission, bucket }.into())
    }

    /// Whether a bucket exists
    #[must_use]
    pub fn contains(&self, submission: SubmissionId, bucket: BucketId) -> bool {
        self.buckets.read().contains_key(&(submission, bucket))
    }

    /// Prepare a bucket announced by a remote writer
    ///
    /// # Errors
    ///
    /// Returns error if the bucket exists with a different sort key
    pub fn alert(&self, alert: BucketAlert) -> CoreResult<()> {
        self.get_or_create(alert.submission, alert.bucket, alert.sort)
            .map(|_| ())
    }

    /// Apply a shipment: store its tuples, then account for its writer
    ///
    /// # Errors
    ///
    /// Returns error if the bucket no longer accepts writes
    pub fn deliver(&self, shipment: BucketShipment) -> CoreResult<()> {
        let bucket = self.get_or_create(shipment.submission, shipment.bucket, shipment.sort)?;
        let received = shipment.tuples.len() as u64;
        bucket.add_all(shipment.tuples)?;
        let sealed = bucket.finish_writer(shipment.writer)?;

        let mut stats = self.stats.lock();
        stats.shipments += 1;
        stats.tuples_received += received;
        if sealed {
            stats.sealed += 1;
        }
        Ok(())
    }

    /// Remove every bucket of a submission, waking blocked readers
    pub fn remove_submission(&self, submission: SubmissionId) -> usize {
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|(owner, _), bucket| {
            if *owner == submission {
                bucket.remove();
                false
            } else {
                true
            }
        });
        let removed = before - buckets.len();
        self.stats.lock().bucket_count = buckets.len();
        removed
    }

    /// Remove every bucket
    pub fn clear(&self) {
        let mut buckets = self.buckets.write();
        for bucket in buckets.values() {
            bucket.remove();
        }
        buckets.clear();
        self.stats.lock().bucket_count = 0;
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    fn check_sort(bucket: &Arc<Bucket>, sort: Option<&[usize]>) -> CoreResult<Arc<Bucket>> {
        match sort {
            Some(fields) if !bucket.adopt_sort(fields) => {
                Err(BucketError::SortMismatch { bucket: bucket.id() }.into())
            }
            _ => Ok(Arc::clone(bucket)),
        }
    }
}
