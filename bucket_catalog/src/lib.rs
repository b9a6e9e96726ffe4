//! In-memory catalog grouping individually arriving time-stamped
//! measurements into compact, bounded buckets ahead of a single storage
//! write per bucket.
//!
//! # Overview
//!
//! The catalog sits on the hot path of a time-series ingestion pipeline.
//! Every insert locates (or allocates) the open bucket for its
//! (namespace, metadata) pair, rolls the bucket over when a capacity limit
//! would be breached, and appends the measurement to the calling session's
//! [`WriteBatch`]:
//!
//! ```text
//!    insert ──▶ BucketCatalog ──▶ open bucket for (namespace, metadata)
//!                                     │
//!                                     ▼
//!                          session's WriteBatch
//! ```
//!
//! The client that wins [`WriteBatch::claim_commit_rights`] drives the
//! commit handshake: [`BucketCatalog::prepare_commit`] freezes the batch and
//! folds it into the bucket's min/max trackers, the caller performs its
//! external storage write, and [`BucketCatalog::finish`] (or
//! [`BucketCatalog::abort`]) resolves the batch's outcome for every waiting
//! session. Buckets are bounded along three axes (measurement count,
//! serialized size, time span), and idle buckets are expired
//! least-recently-used once aggregate memory crosses a threshold.
//!
//! Capacity and memory limits are supplied through [`CatalogConfig`];
//! per-collection bucketing parameters through [`BucketingOptions`].

#![deny(rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self
)]

mod access;
mod batch;
mod bson_util;
mod bucket;
mod catalog;
mod metadata;
mod min_max;
mod state;
mod stats;
mod types;

pub use crate::batch::{CommitInfo, StorageError, WriteBatch};
pub use crate::bucket::BucketHandle;
pub use crate::catalog::{BucketCatalog, Error, Result};
pub use crate::metadata::BucketMetadata;
pub use crate::state::BucketState;
pub use crate::stats::ExecutionStats;
pub use crate::types::{
    BinaryComparator, BucketId, BucketingOptions, CatalogConfig, CombinePolicy, Namespace,
    SessionId, StringComparator,
};
