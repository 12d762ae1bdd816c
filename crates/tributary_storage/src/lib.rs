//! TRIBUTARY Storage
//!
//! Node-local data holders shared by the chains of a submission:
//! buckets for shuffling records, split streams for direct hand-off
//! between two chains, and the submission cache.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bucket;
pub mod buckets;
pub mod cache;
pub mod split;

pub use bucket::{Bucket, BucketAlert, BucketContents, BucketShipment, BucketState, WriterReport};
pub use buckets::{BucketError, BucketStore, RemoteBuckets, StoreStats};
pub use cache::{CacheBroadcaster, SYNC_TOKEN_PREFIX, SubmissionCache, sync_token_key};
pub use split::{SplitReader, SplitRegistry, SplitWriter};
