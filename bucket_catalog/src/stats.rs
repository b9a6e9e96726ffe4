//! Per-namespace execution counters.

use std::sync::atomic::{AtomicU64, Ordering};

use bson::Document;

/// Counters for one namespace's traffic through the catalog.
///
/// All increments use relaxed ordering; the counters are observability
/// surface, not synchronisation, and callers provide any ordering they need.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub(crate) num_bucket_inserts: AtomicU64,
    pub(crate) num_bucket_updates: AtomicU64,
    pub(crate) num_buckets_opened_due_to_metadata: AtomicU64,
    pub(crate) num_buckets_closed_due_to_count: AtomicU64,
    pub(crate) num_buckets_closed_due_to_size: AtomicU64,
    pub(crate) num_buckets_closed_due_to_time_forward: AtomicU64,
    pub(crate) num_buckets_closed_due_to_time_backward: AtomicU64,
    pub(crate) num_buckets_closed_due_to_memory_threshold: AtomicU64,
    pub(crate) num_commits: AtomicU64,
    pub(crate) num_waits: AtomicU64,
    pub(crate) num_measurements_committed: AtomicU64,
}

impl ExecutionStats {
    pub(crate) fn append(&self, builder: &mut Document) {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed) as i64;

        builder.insert("numBucketInserts", load(&self.num_bucket_inserts));
        builder.insert("numBucketUpdates", load(&self.num_bucket_updates));
        builder.insert(
            "numBucketsOpenedDueToMetadata",
            load(&self.num_buckets_opened_due_to_metadata),
        );
        builder.insert(
            "numBucketsClosedDueToCount",
            load(&self.num_buckets_closed_due_to_count),
        );
        builder.insert(
            "numBucketsClosedDueToSize",
            load(&self.num_buckets_closed_due_to_size),
        );
        builder.insert(
            "numBucketsClosedDueToTimeForward",
            load(&self.num_buckets_closed_due_to_time_forward),
        );
        builder.insert(
            "numBucketsClosedDueToTimeBackward",
            load(&self.num_buckets_closed_due_to_time_backward),
        );
        builder.insert(
            "numBucketsClosedDueToMemoryThreshold",
            load(&self.num_buckets_closed_due_to_memory_threshold),
        );
        let commits = self.num_commits.load(Ordering::Relaxed);
        builder.insert("numCommits", commits as i64);
        builder.insert("numWaits", load(&self.num_waits));
        let measurements = self.num_measurements_committed.load(Ordering::Relaxed);
        builder.insert("numMeasurementsCommitted", measurements as i64);
        if commits > 0 {
            builder.insert("avgNumMeasurementsPerCommit", (measurements / commits) as i64);
        }
    }
}
