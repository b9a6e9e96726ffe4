//! Write batches: the unit of commit.
//!
//! A batch collects the measurements one client session is adding to one
//! bucket. Exactly one caller wins the commit rights for a batch; everyone
//! else blocks on the batch's outcome promise.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bson::Document;
use parking_lot::{Condvar, Mutex};
use once_cell::sync::OnceCell;
use snafu::Snafu;

use crate::bucket::{Bucket, BucketHandle};
use crate::catalog::{Error, Result};
use crate::min_max::Extremum;
use crate::stats::ExecutionStats;
use crate::types::{BucketId, Namespace, SessionId};

/// Status of the caller's external storage write, handed back through
/// [`finish`](crate::BucketCatalog::finish).
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum StorageError {
    #[snafu(display("storage write conflict"))]
    WriteConflict,
    #[snafu(display("storage write failed: {}", message))]
    WriteFailed { message: String },
}

/// Outcome of one batch's commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub result: Result<(), StorageError>,
}

/// Payload of a successfully prepared batch, immutable from then on.
#[derive(Debug)]
struct PreparedBatch {
    bucket_id: BucketId,
    min: Document,
    max: Document,
    new_field_names: BTreeSet<String>,
    num_previously_committed: u32,
    measurements: Vec<Document>,
}

/// Measurements still being appended by the owning session.
#[derive(Debug, Default)]
struct ActiveBatch {
    measurements: Vec<Document>,
    new_field_names: BTreeSet<String>,
}

/// Broadcast cell resolving every waiter with the batch outcome.
#[derive(Debug, Default)]
struct OutcomeCell {
    outcome: Mutex<Option<Result<CommitInfo>>>,
    ready: Condvar,
}

impl OutcomeCell {
    fn is_set(&self) -> bool {
        self.outcome.lock().is_some()
    }

    fn set(&self, outcome: Result<CommitInfo>) {
        let mut slot = self.outcome.lock();
        assert!(slot.is_none(), "batch outcome resolved twice");
        *slot = Some(outcome);
        self.ready.notify_all();
    }

    /// Like `set`, but a no-op when the outcome is already resolved.
    fn try_set(&self, outcome: Result<CommitInfo>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.ready.notify_all();
        }
    }

    fn wait(&self) -> Result<CommitInfo> {
        let mut slot = self.outcome.lock();
        while slot.is_none() {
            self.ready.wait(&mut slot);
        }
        slot.clone().expect("outcome checked above")
    }
}

/// The set of measurements a single client session intends to commit to one
/// bucket atomically.
///
/// Lifecycle: *active* (appending) → *prepared* (selected to commit, payload
/// frozen) → *finished* (outcome resolved by `finish` or an abort).
#[derive(Debug)]
pub struct WriteBatch {
    /// Back-reference to the bucket; detached once the batch finishes.
    bucket: Mutex<Option<BucketHandle>>,
    session_id: SessionId,
    ns: Namespace,
    stats: Arc<ExecutionStats>,
    commit_rights: AtomicBool,
    active: Mutex<Option<ActiveBatch>>,
    prepared: OnceCell<PreparedBatch>,
    outcome: OutcomeCell,
}

impl WriteBatch {
    pub(crate) fn new(
        bucket: BucketHandle,
        session_id: SessionId,
        ns: Namespace,
        stats: Arc<ExecutionStats>,
    ) -> Self {
        Self {
            bucket: Mutex::new(Some(bucket)),
            session_id,
            ns,
            stats,
            commit_rights: AtomicBool::new(false),
            active: Mutex::new(Some(ActiveBatch::default())),
            prepared: OnceCell::new(),
            outcome: OutcomeCell::default(),
        }
    }

    /// Attempts to claim the right to commit this batch. Returns true to
    /// exactly one caller; the losers wait on [`Self::get_result`].
    pub fn claim_commit_rights(&self) -> bool {
        !self.commit_rights.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn commit_rights_claimed(&self) -> bool {
        self.commit_rights.load(Ordering::Acquire)
    }

    /// Whether the outcome has been resolved.
    pub fn finished(&self) -> bool {
        self.outcome.is_set()
    }

    /// Whether the batch is still accepting measurements.
    pub fn active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Blocks until the batch outcome is resolved and returns it. A resolved
    /// outcome returns immediately; otherwise the wait is counted in
    /// `numWaits`.
    pub fn get_result(&self) -> Result<CommitInfo> {
        if !self.outcome.is_set() {
            self.stats.num_waits.fetch_add(1, Ordering::Relaxed);
        }
        self.outcome.wait()
    }

    /// The bucket this batch writes to, until the batch finishes.
    pub fn bucket(&self) -> Option<BucketHandle> {
        self.bucket.lock().clone()
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub(crate) fn stats(&self) -> &Arc<ExecutionStats> {
        &self.stats
    }

    pub(crate) fn add_measurement(&self, doc: Document) {
        self.active
            .lock()
            .as_mut()
            .expect("measurement appended to an inactive batch")
            .measurements
            .push(doc);
    }

    pub(crate) fn record_new_fields(&self, fields: BTreeSet<String>) {
        self.active
            .lock()
            .as_mut()
            .expect("fields recorded on an inactive batch")
            .new_field_names
            .extend(fields);
    }

    /// Freezes the batch and folds its measurements into `bucket`.
    ///
    /// The bucket's min/max and field set are mutated *here*, not at finish:
    /// a failed storage write later does not roll them back. This trades
    /// rollback fidelity for keeping the prepared batch the single
    /// serialization point of min/max and field-set updates.
    pub(crate) fn prepare_commit(&self, bucket: &mut Bucket) {
        assert!(
            self.commit_rights_claimed(),
            "batch prepared without commit rights"
        );
        let ActiveBatch {
            measurements,
            new_field_names,
        } = self
            .active
            .lock()
            .take()
            .expect("prepared batch was not active");

        let num_previously_committed = bucket.num_committed_measurements;

        // Drop field names another batch has committed in the interim; the
        // survivors enter the bucket's field set now.
        let mut filtered = BTreeSet::new();
        for name in new_field_names {
            if !bucket.field_names.contains(&name) {
                bucket.memory_usage += name.len() as u64 + 1;
                bucket.field_names.insert(name.clone());
                filtered.insert(name);
            }
        }

        let key = bucket
            .key
            .as_ref()
            .expect("prepared bucket was never written to");
        let meta_field = key.metadata.meta_field().map(str::to_string);
        let comparator = Arc::clone(key.metadata.comparator());

        bucket.memory_usage -= bucket.min.memory_usage() + bucket.max.memory_usage();
        for doc in &measurements {
            bucket
                .min
                .update(doc, meta_field.as_deref(), &*comparator, Extremum::Min);
            bucket
                .max
                .update(doc, meta_field.as_deref(), &*comparator, Extremum::Max);
        }
        bucket.memory_usage += bucket.min.memory_usage() + bucket.max.memory_usage();

        // First commit writes the full extrema; later commits ship a diff.
        let (min, max) = if num_previously_committed > 0 {
            (bucket.min.updates(), bucket.max.updates())
        } else {
            let (min, max) = (bucket.min.to_bson(), bucket.max.to_bson());
            // the full payload reports everything; reset the dirty bits so
            // the next commit diffs only against what ships here
            bucket.min.clear_updated();
            bucket.max.clear_updated();
            (min, max)
        };

        let prepared = PreparedBatch {
            bucket_id: bucket.id,
            min,
            max,
            new_field_names: filtered,
            num_previously_committed,
            measurements,
        };
        assert!(
            self.prepared.set(prepared).is_ok(),
            "batch prepared twice"
        );
    }

    pub(crate) fn finish(&self, info: CommitInfo) {
        self.outcome.set(Ok(info));
        *self.bucket.lock() = None;
    }

    /// Resolves the batch with the bucket-cleared error and detaches it.
    pub(crate) fn abort_cleared(&self, id: BucketId) {
        self.outcome.try_set(Err(Error::BucketCleared {
            id,
            ns: self.ns.clone(),
        }));
        *self.active.lock() = None;
        *self.bucket.lock() = None;
    }

    fn payload(&self) -> &PreparedBatch {
        self.prepared.get().expect("batch is not prepared")
    }

    /// The bucket identity captured at prepare time; this is the id the
    /// external storage write targets.
    pub fn bucket_id(&self) -> BucketId {
        self.payload().bucket_id
    }

    /// Minimum payload: full extrema on the bucket's first commit, a
    /// structural diff afterwards.
    pub fn min(&self) -> &Document {
        &self.payload().min
    }

    /// Maximum payload, same shape as [`Self::min`].
    pub fn max(&self) -> &Document {
        &self.payload().max
    }

    /// Top-level field names this commit introduces to the bucket.
    pub fn new_field_names(&self) -> &BTreeSet<String> {
        &self.payload().new_field_names
    }

    pub fn num_previously_committed_measurements(&self) -> u32 {
        self.payload().num_previously_committed
    }

    /// The batch's measurements in insertion order.
    pub fn measurements(&self) -> &[Document] {
        &self.payload().measurements
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use uuid::Uuid;

    use super::*;

    fn batch() -> Arc<WriteBatch> {
        let id = BucketId::new(bson::DateTime::from_millis(0), 1);
        let bucket = Arc::new(Mutex::new(Bucket::new(1, 0, id)));
        let handle = BucketHandle {
            serial: 1,
            stripe: 0,
            bucket,
        };
        Arc::new(WriteBatch::new(
            handle,
            Uuid::new_v4(),
            Namespace::new("db", "weather"),
            Arc::new(ExecutionStats::default()),
        ))
    }

    #[test]
    fn commit_rights_have_one_winner() {
        let batch = batch();
        assert!(batch.claim_commit_rights());
        assert!(!batch.claim_commit_rights());
        assert!(batch.commit_rights_claimed());
    }

    #[test]
    fn abort_resolves_and_detaches() {
        let batch = batch();
        let id = BucketId::new(bson::DateTime::from_millis(0), 1);
        assert!(batch.active());
        assert!(!batch.finished());

        batch.abort_cleared(id);
        assert!(batch.finished());
        assert!(!batch.active());
        assert!(batch.bucket().is_none());
        assert_matches!(batch.get_result(), Err(Error::BucketCleared { .. }));
        // resolving again is a no-op
        batch.abort_cleared(id);
    }

    #[test]
    fn result_wakes_a_blocked_waiter() {
        let batch = batch();
        let waiter = {
            let batch = Arc::clone(&batch);
            std::thread::spawn(move || batch.get_result())
        };
        batch.finish(CommitInfo { result: Ok(()) });
        assert_eq!(
            waiter.join().unwrap(),
            Ok(CommitInfo { result: Ok(()) })
        );
        // an already-resolved outcome returns immediately and without
        // touching the wait counter
        let waits = batch.stats().num_waits.load(Ordering::Relaxed);
        assert_eq!(batch.get_result(), Ok(CommitInfo { result: Ok(()) }));
        assert_eq!(batch.stats().num_waits.load(Ordering::Relaxed), waits);
    }

    #[test]
    fn try_set_keeps_the_first_outcome() {
        let cell = OutcomeCell::default();
        cell.try_set(Ok(CommitInfo { result: Ok(()) }));
        cell.try_set(Ok(CommitInfo {
            result: Err(StorageError::WriteConflict),
        }));
        assert_eq!(cell.wait(), Ok(CommitInfo { result: Ok(()) }));
    }
}
