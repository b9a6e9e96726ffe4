//! The bucket catalog: routes measurements to buckets, bounds bucket growth,
//! serializes commits per bucket and bounds total memory.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bson::{Bson, Document};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use snafu::Snafu;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::access::{BucketAccess, BucketGuard};
use crate::batch::{CommitInfo, WriteBatch};
use crate::bucket::{Bucket, BucketHandle, SharedBucket};
use crate::metadata::{BucketKey, BucketMetadata};
use crate::state::{BucketState, BucketStateMap};
use crate::stats::ExecutionStats;
use crate::types::{
    BucketId, BucketSerial, BucketingOptions, CatalogConfig, CombinePolicy, Namespace, SessionId,
    StringComparator,
};

/// Number of stripes sharding the catalog's bucket indexes.
const NUM_STRIPES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display(
        "'{}' must be present and contain a valid datetime value",
        time_field
    ))]
    InvalidTimeField { time_field: String },

    #[snafu(display("time-series bucket {} for {} was cleared", id, ns))]
    BucketCleared { id: BucketId, ns: Namespace },

    #[snafu(display(
        "bucket {} was cleared while a commit was prepared; the write must be retried",
        id
    ))]
    WriteConflict { id: BucketId },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Session shared by every caller that allows combining with inserts from
/// other clients.
static SHARED_SESSION: Lazy<SessionId> = Lazy::new(Uuid::new_v4);

/// One shard of the catalog's indexes: the open bucket per key and the live
/// set, for keys hashing to this stripe.
#[derive(Debug, Default)]
pub(crate) struct Stripe {
    pub(crate) open_buckets: HashMap<BucketKey, SharedBucket>,
    pub(crate) buckets: HashMap<BucketSerial, SharedBucket>,
}

/// LRU list of idle buckets. Tokens increase monotonically, so the entry
/// with the smallest token went idle the longest ago.
#[derive(Debug, Default)]
struct IdleList {
    entries: BTreeMap<u64, IdleEntry>,
    next_token: u64,
}

#[derive(Debug, Clone, Copy)]
struct IdleEntry {
    serial: BucketSerial,
    stripe: usize,
}

/// The process-wide bucket catalog.
///
/// All public operations are thread-safe. Readers locate buckets under one
/// stripe of the index in shared mode; allocation, removal and rollover take
/// the key's stripe exclusively. The per-bucket mutex, reached through
/// [`BucketAccess`], provides the actual mutual exclusion on bucket state.
#[derive(Debug)]
pub struct BucketCatalog {
    pub(crate) stripes: [RwLock<Stripe>; NUM_STRIPES],
    pub(crate) states: BucketStateMap,
    idle_buckets: Mutex<IdleList>,
    memory_usage: AtomicU64,
    execution_stats: RwLock<HashMap<Namespace, Arc<ExecutionStats>>>,
    next_serial: AtomicU64,
    config: CatalogConfig,
}

impl Default for BucketCatalog {
    fn default() -> Self {
        Self::new(CatalogConfig::default())
    }
}

impl BucketCatalog {
    pub fn new(config: CatalogConfig) -> Self {
        Self {
            stripes: std::array::from_fn(|_| RwLock::new(Stripe::default())),
            states: BucketStateMap::default(),
            idle_buckets: Mutex::new(IdleList::default()),
            memory_usage: AtomicU64::new(0),
            execution_stats: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            config,
        }
    }

    /// Routes one measurement into the open bucket for its namespace and
    /// metadata, rolling the bucket over first if admitting the measurement
    /// would breach a capacity limit. Returns the session's batch for the
    /// target bucket.
    pub fn insert(
        &self,
        session_id: SessionId,
        ns: &Namespace,
        comparator: Arc<dyn StringComparator>,
        options: &BucketingOptions,
        doc: Document,
        combine: CombinePolicy,
    ) -> Result<Arc<WriteBatch>> {
        let mut metadata = Document::new();
        if let Some(meta_field) = &options.meta_field {
            match doc.get(meta_field) {
                Some(value) => metadata.insert(meta_field.as_str(), value.clone()),
                None => metadata.insert(meta_field.as_str(), Bson::Null),
            };
        }
        let key = BucketKey {
            ns: ns.clone(),
            metadata: BucketMetadata::new(metadata, comparator),
        };

        let stats = self.execution_stats(ns);

        let time = match doc.get(&options.time_field) {
            Some(Bson::DateTime(time)) => *time,
            _ => {
                return InvalidTimeFieldSnafu {
                    time_field: options.time_field.clone(),
                }
                .fail()
            }
        };

        let session = match combine {
            CombinePolicy::Allow => *SHARED_SESSION,
            CombinePolicy::Disallow => session_id,
        };

        self.expire_idle_buckets(&stats);

        let mut bucket = BucketAccess::for_key(self, &key, &stats, time);

        let meta_field = options.meta_field.as_deref();
        let mut change = bucket.calculate_bucket_fields_and_size_change(&doc, meta_field);
        let size_to_be_added = change.size;

        if bucket.key.is_some()
            && Self::is_bucket_full(&mut bucket, time, size_to_be_added, options, &self.config, &stats)
        {
            bucket.rollover(|b| {
                Self::is_bucket_full(b, time, size_to_be_added, options, &self.config, &stats)
            });
            change = bucket.calculate_bucket_fields_and_size_change(&doc, meta_field);
        }

        let handle = bucket.handle();
        let batch = bucket.active_batch(session, ns, &stats, &handle);
        trace!(
            ns = %ns,
            bucket = %bucket.id,
            size = change.size,
            new_field_bytes = change.field_name_bytes,
            "buffered measurement"
        );
        batch.add_measurement(doc);
        batch.record_new_fields(change.new_field_names);

        bucket.num_measurements += 1;
        bucket.size += change.size;
        if time > bucket.latest_time {
            bucket.latest_time = time;
        }
        if bucket.key.is_none() {
            // Newly minted bucket: take on the key and charge the fixed
            // contributions. Namespace and metadata are each stored twice
            // (bucket and open-index key); the allocation itself is
            // referenced from the live set and the open index.
            let metadata_size = key.metadata.size();
            bucket.key = Some(key.clone());
            bucket.memory_usage += ns.size() * 2
                + metadata_size * 2
                + (mem::size_of::<Bucket>() + mem::size_of::<SharedBucket>() * 2) as u64;
        } else {
            self.memory_usage
                .fetch_sub(bucket.memory_usage, Ordering::Relaxed);
        }
        self.memory_usage
            .fetch_add(bucket.memory_usage, Ordering::Relaxed);

        Ok(batch)
    }

    /// Evaluates the fullness predicate, recording the close reason of the
    /// first matching limit. A measurement older than the bucket's open time
    /// rewinds an uncommitted bucket instead of closing it when the span
    /// still fits.
    fn is_bucket_full(
        bucket: &mut BucketAccess<'_>,
        time: bson::DateTime,
        size_to_be_added: u64,
        options: &BucketingOptions,
        config: &CatalogConfig,
        stats: &ExecutionStats,
    ) -> bool {
        if bucket.num_measurements == config.bucket_max_count {
            stats
                .num_buckets_closed_due_to_count
                .fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if bucket.size + size_to_be_added > config.bucket_max_size {
            stats
                .num_buckets_closed_due_to_size
                .fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let bucket_time = bucket.open_time().timestamp_millis();
        let span = i64::from(options.bucket_max_span_seconds) * 1000;
        let time = time.timestamp_millis();
        if time - bucket_time >= span {
            stats
                .num_buckets_closed_due_to_time_forward
                .fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if time < bucket_time {
            if !bucket.has_been_committed()
                && bucket.latest_time.timestamp_millis() - time < span
            {
                bucket.rewind_time();
            } else {
                stats
                    .num_buckets_closed_due_to_time_backward
                    .fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Selects `batch` as the bucket's next committer, waiting until any
    /// earlier prepared batch has finished, and freezes its payload.
    ///
    /// Returns false (and aborts the batch) when the bucket was cleared or
    /// retired in the meantime; the caller must not proceed with its
    /// storage write.
    pub fn prepare_commit(&self, batch: &Arc<WriteBatch>) -> bool {
        if batch.finished() {
            // someone aborted the batch behind our back
            return false;
        }

        self.wait_to_commit_batch(batch);

        let Some(handle) = batch.bucket() else {
            self.abort(batch);
            return false;
        };
        let mut bucket = BucketAccess::for_bucket(self, &handle);
        if !bucket.is_locked() {
            drop(bucket);
            self.abort(batch);
            return false;
        }

        self.states
            .transition(bucket.id, BucketState::Prepared)
            .expect("prepared bucket has no state entry");

        let previous_memory = bucket.memory_usage;
        batch.prepare_commit(&mut bucket);
        self.memory_usage
            .fetch_sub(previous_memory, Ordering::Relaxed);
        self.memory_usage
            .fetch_add(bucket.memory_usage, Ordering::Relaxed);

        let session = batch.session_id();
        bucket.batches.remove(&session);
        true
    }

    /// Resolves a prepared batch with the outcome of its storage write,
    /// clears the bucket's prepared slot and either retires the bucket or
    /// returns it to the idle list.
    pub fn finish(&self, batch: &Arc<WriteBatch>, info: CommitInfo) {
        assert!(!batch.finished(), "batch already finished");
        assert!(!batch.active(), "batch must be prepared before finishing");

        let handle = batch
            .bucket()
            .expect("finishing a batch that was already detached");
        let mut bucket = BucketAccess::for_bucket(self, &handle);

        batch.finish(info.clone());

        let mut now_cleared = false;
        if bucket.is_locked() {
            let state = self
                .states
                .transition(bucket.id, BucketState::Normal)
                .expect("finished bucket has no state entry");
            now_cleared = state == BucketState::Cleared;
            bucket.prepared_batch = None;
        }

        if info.result.is_ok() {
            let stats = batch.stats();
            stats.num_commits.fetch_add(1, Ordering::Relaxed);
            if batch.num_previously_committed_measurements() == 0 {
                stats.num_bucket_inserts.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.num_bucket_updates.fetch_add(1, Ordering::Relaxed);
            }

            let committed = batch.measurements().len() as u64;
            stats
                .num_measurements_committed
                .fetch_add(committed, Ordering::Relaxed);
            if bucket.is_locked() {
                bucket.num_committed_measurements += committed as u32;
            }
        }

        if bucket.is_locked() && bucket.all_committed() {
            if bucket.full || now_cleared {
                // Nothing more can land here: a full bucket was already
                // replaced in the open index by its rollover successor, and
                // a cleared one must not accept further inserts. Retire it.
                let serial = bucket.serial;
                let stripe_index = bucket.stripe;
                bucket.release();

                let mut stripe = self.stripes[stripe_index].write();
                if let Some(shared) = stripe.buckets.get(&serial).map(Arc::clone) {
                    let guard = shared.lock_arc();
                    self.remove_bucket_locked(&mut stripe, guard);
                }
            } else {
                self.mark_bucket_idle(&mut bucket);
            }
        }
    }

    /// Aborts the batch (commit rights required) along with every other
    /// batch on its bucket, and removes the bucket. Waiters resolve with
    /// [`Error::BucketCleared`].
    pub fn abort(&self, batch: &Arc<WriteBatch>) {
        assert!(
            batch.commit_rights_claimed(),
            "abort requires commit rights"
        );
        if batch.finished() {
            debug_assert!(matches!(
                batch.get_result(),
                Err(Error::BucketCleared { .. })
            ));
            return;
        }

        let Some(handle) = batch.bucket() else {
            // resolved concurrently; nothing left to do
            return;
        };

        let mut stripe = self.stripes[handle.stripe].write();
        if !stripe.buckets.contains_key(&handle.serial) {
            // the bucket is already gone; only this batch needs resolving
            let id = handle.bucket.lock().id;
            batch.abort_cleared(id);
            return;
        }
        let guard = handle.bucket.lock_arc();
        self.abort_bucket_locked(&mut stripe, guard, Some(batch));
    }

    /// Marks the identified bucket cleared. Returns
    /// [`Error::WriteConflict`] when the bucket currently has a prepared
    /// commit in flight; the caller must surface a retryable conflict to
    /// its own transaction.
    pub fn clear_bucket(&self, id: BucketId) -> Result<()> {
        if self.states.transition(id, BucketState::Cleared)
            == Some(BucketState::PreparedAndCleared)
        {
            return WriteConflictSnafu { id }.fail();
        }
        Ok(())
    }

    /// Aborts every bucket of the namespace and drops its counters.
    pub fn clear_namespace(&self, ns: &Namespace) {
        self.clear_matching(&|bucket_ns| bucket_ns == ns);
    }

    /// Aborts every bucket of every collection in the database.
    pub fn clear_database(&self, db: &str) {
        self.clear_matching(&|bucket_ns| bucket_ns.database() == db);
    }

    fn clear_matching(&self, should_clear: &dyn Fn(&Namespace) -> bool) {
        let mut cleared = Vec::new();
        for stripe_lock in &self.stripes {
            let mut stripe = stripe_lock.write();
            let candidates: Vec<SharedBucket> =
                stripe.buckets.values().map(Arc::clone).collect();
            for bucket in candidates {
                let guard = bucket.lock_arc();
                let ns = guard.key.as_ref().map(|key| key.ns.clone());
                match ns {
                    Some(ns) if should_clear(&ns) => {
                        self.abort_bucket_locked(&mut stripe, guard, None);
                        cleared.push(ns);
                    }
                    _ => {}
                }
            }
        }

        if !cleared.is_empty() {
            let mut stats = self.execution_stats.write();
            for ns in cleared {
                stats.remove(&ns);
            }
        }
    }

    /// The bucket's original metadata, or `None` once it has been retired.
    pub fn get_metadata(&self, handle: &BucketHandle) -> Option<Document> {
        let bucket = BucketAccess::for_bucket(self, handle);
        if !bucket.is_locked() {
            return None;
        }
        Some(
            bucket
                .key
                .as_ref()
                .map(|key| key.metadata.to_document().clone())
                .unwrap_or_default(),
        )
    }

    /// Appends the namespace's execution counters to `builder`, using the
    /// canonical counter names.
    pub fn append_execution_stats(&self, ns: &Namespace, builder: &mut Document) {
        let stats = self
            .execution_stats
            .read()
            .get(ns)
            .map(Arc::clone)
            .unwrap_or_default();
        stats.append(builder);
    }

    /// Appends the global snapshot section: bucket counts and aggregate
    /// memory usage.
    pub fn append_status(&self, builder: &mut Document) {
        let mut num_buckets = 0;
        let mut num_open_buckets = 0;
        for stripe in &self.stripes {
            let stripe = stripe.read();
            num_buckets += stripe.buckets.len();
            num_open_buckets += stripe.open_buckets.len();
        }
        builder.insert("numBuckets", num_buckets as i64);
        builder.insert("numOpenBuckets", num_open_buckets as i64);
        builder.insert("numIdleBuckets", self.num_idle_buckets() as i64);
        builder.insert(
            "memoryUsage",
            self.memory_usage.load(Ordering::Relaxed) as i64,
        );
    }

    /// Aggregate memory charged to live buckets.
    pub fn memory_usage(&self) -> u64 {
        self.memory_usage.load(Ordering::Relaxed)
    }

    /// Blocks until the bucket's prepared slot is free and installs `batch`
    /// into it. Returns with nothing installed when the bucket is gone.
    fn wait_to_commit_batch(&self, batch: &Arc<WriteBatch>) {
        loop {
            let Some(handle) = batch.bucket() else { return };
            let mut bucket = BucketAccess::for_bucket(self, &handle);
            if !bucket.is_locked() {
                return;
            }

            let current = bucket.prepared_batch.as_ref().map(Arc::clone);
            match current {
                None => {
                    bucket.prepared_batch = Some(Arc::clone(batch));
                    return;
                }
                Some(current) => {
                    // wait outside every lock; the previous committer's
                    // status is irrelevant here
                    bucket.release();
                    drop(bucket);
                    let _ = current.get_result();
                }
            }
        }
    }

    fn execution_stats(&self, ns: &Namespace) -> Arc<ExecutionStats> {
        {
            let stats = self.execution_stats.read();
            if let Some(stats) = stats.get(ns) {
                return Arc::clone(stats);
            }
        }
        let mut stats = self.execution_stats.write();
        Arc::clone(stats.entry(ns.clone()).or_default())
    }

    pub(crate) fn stripe_index(&self, key: &BucketKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_STRIPES
    }

    /// Allocates a fresh bucket for `key` into the stripe's indexes.
    pub(crate) fn allocate_bucket(
        &self,
        stripe: &mut Stripe,
        stripe_index: usize,
        key: &BucketKey,
        time: bson::DateTime,
    ) -> SharedBucket {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let id = BucketId::new(time, serial);
        let bucket = Arc::new(Mutex::new(Bucket::new(serial, stripe_index, id)));
        self.states.insert_new(id);
        stripe.buckets.insert(serial, Arc::clone(&bucket));
        stripe.open_buckets.insert(key.clone(), Arc::clone(&bucket));
        debug!(bucket = %id, ns = %key.ns, "opened bucket");
        bucket
    }

    /// Removes the bucket from every index. The caller holds the bucket's
    /// stripe exclusively and the bucket's own lock; the bucket must have no
    /// outstanding work.
    pub(crate) fn remove_bucket_locked(&self, stripe: &mut Stripe, mut guard: BucketGuard) -> bool {
        let serial = guard.serial;
        let Some(this) = stripe.buckets.get(&serial).map(Arc::clone) else {
            return false;
        };
        assert!(
            guard.batches.is_empty(),
            "removed bucket still has active batches"
        );
        assert!(
            guard.prepared_batch.is_none(),
            "removed bucket still has a prepared batch"
        );

        self.memory_usage
            .fetch_sub(guard.memory_usage, Ordering::Relaxed);
        self.mark_bucket_not_idle(&mut guard);
        if let Some(key) = guard.key.as_ref() {
            // only drop the open-index entry while it still points at this
            // bucket; a full bucket's key already maps to its successor
            let points_here = stripe
                .open_buckets
                .get(key)
                .map_or(false, |open| Arc::ptr_eq(open, &this));
            if points_here {
                stripe.open_buckets.remove(key);
            }
        }
        self.states.remove(guard.id);
        drop(guard);
        stripe.buckets.remove(&serial);
        true
    }

    /// Aborts all of the bucket's batches (and the prepared one when it is
    /// the caller's own) and removes the bucket.
    pub(crate) fn abort_bucket_locked(
        &self,
        stripe: &mut Stripe,
        mut guard: BucketGuard,
        batch: Option<&Arc<WriteBatch>>,
    ) {
        let id = guard.id;
        debug!(bucket = %id, "aborting bucket");
        for (_, active) in guard.batches.drain() {
            active.abort_cleared(id);
        }
        if let Some(prepared) = guard.prepared_batch.take() {
            if let Some(batch) = batch {
                if Arc::ptr_eq(&prepared, batch) {
                    prepared.abort_cleared(id);
                }
            }
        }
        self.remove_bucket_locked(stripe, guard);
    }

    pub(crate) fn mark_bucket_idle(&self, bucket: &mut Bucket) {
        debug_assert!(bucket.idle_token.is_none(), "bucket marked idle twice");
        let mut idle = self.idle_buckets.lock();
        let token = idle.next_token;
        idle.next_token += 1;
        idle.entries.insert(
            token,
            IdleEntry {
                serial: bucket.serial,
                stripe: bucket.stripe,
            },
        );
        bucket.idle_token = Some(token);
    }

    pub(crate) fn mark_bucket_not_idle(&self, bucket: &mut Bucket) {
        if let Some(token) = bucket.idle_token.take() {
            self.idle_buckets.lock().entries.remove(&token);
        }
    }

    fn num_idle_buckets(&self) -> usize {
        self.idle_buckets.lock().entries.len()
    }

    /// Expires least-recently-used idle buckets while aggregate memory
    /// exceeds the configured threshold. Runs opportunistically at insert
    /// admission.
    fn expire_idle_buckets(&self, stats: &ExecutionStats) {
        while self.memory_usage.load(Ordering::Relaxed) > self.config.idle_memory_threshold {
            let oldest = {
                let idle = self.idle_buckets.lock();
                idle.entries
                    .iter()
                    .next()
                    .map(|(token, entry)| (*token, *entry))
            };
            let Some((token, entry)) = oldest else { break };

            let mut stripe = self.stripes[entry.stripe].write();
            let Some(bucket) = stripe.buckets.get(&entry.serial).map(Arc::clone) else {
                // removed since we peeked, along with its idle entry
                continue;
            };
            let guard = bucket.lock_arc();
            if guard.idle_token != Some(token) {
                // revived since we peeked
                continue;
            }
            let id = guard.id;
            if self.remove_bucket_locked(&mut stripe, guard) {
                stats
                    .num_buckets_closed_due_to_memory_threshold
                    .fetch_add(1, Ordering::Relaxed);
                debug!(bucket = %id, "expired idle bucket under memory pressure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use bson::{doc, DateTime};

    use crate::batch::StorageError;
    use crate::types::BinaryComparator;

    use super::*;

    fn options() -> BucketingOptions {
        BucketingOptions {
            time_field: "time".to_string(),
            meta_field: Some("tag".to_string()),
            bucket_max_span_seconds: 3600,
        }
    }

    fn ns() -> Namespace {
        Namespace::new("db", "weather")
    }

    fn at(seconds: i64) -> DateTime {
        DateTime::from_millis(seconds * 1000)
    }

    fn ok() -> CommitInfo {
        CommitInfo { result: Ok(()) }
    }

    /// Inserts under a fresh session, so every call owns its own batch.
    fn insert(catalog: &BucketCatalog, ns: &Namespace, doc: Document) -> Arc<WriteBatch> {
        catalog
            .insert(
                Uuid::new_v4(),
                ns,
                Arc::new(BinaryComparator),
                &options(),
                doc,
                CombinePolicy::Disallow,
            )
            .unwrap()
    }

    fn commit(catalog: &BucketCatalog, batch: &Arc<WriteBatch>) {
        assert!(batch.claim_commit_rights());
        assert!(catalog.prepare_commit(batch));
        catalog.finish(batch, ok());
    }

    fn serial_of(batch: &Arc<WriteBatch>) -> u64 {
        batch.bucket().expect("batch is detached").serial
    }

    fn stats_doc(catalog: &BucketCatalog, ns: &Namespace) -> Document {
        let mut builder = Document::new();
        catalog.append_execution_stats(ns, &mut builder);
        builder
    }

    fn status(catalog: &BucketCatalog) -> Document {
        let mut builder = Document::new();
        catalog.append_status(&mut builder);
        builder
    }

    #[test]
    fn reordered_metadata_shares_a_bucket() {
        let catalog = BucketCatalog::default();
        let b1 = insert(
            &catalog,
            &ns(),
            doc! { "_id": 0, "time": at(0), "tag": { "a": 1, "b": 1 } },
        );
        let b2 = insert(
            &catalog,
            &ns(),
            doc! { "_id": 1, "time": at(1), "tag": { "b": 1, "a": 1 } },
        );
        assert_eq!(serial_of(&b1), serial_of(&b2));

        let report = stats_doc(&catalog, &ns());
        assert_eq!(report.get_i64("numBucketsOpenedDueToMetadata").unwrap(), 1);
    }

    #[test]
    fn distinct_metadata_splits_buckets() {
        let catalog = BucketCatalog::default();
        let b1 = insert(&catalog, &ns(), doc! { "time": at(0), "tag": "a" });
        let b2 = insert(&catalog, &ns(), doc! { "time": at(1), "tag": "b" });
        assert_ne!(serial_of(&b1), serial_of(&b2));

        let report = status(&catalog);
        assert_eq!(report.get_i64("numBuckets").unwrap(), 2);
        assert_eq!(report.get_i64("numOpenBuckets").unwrap(), 2);
    }

    #[test]
    fn insert_requires_a_datetime_time_field() {
        let catalog = BucketCatalog::default();
        for doc in [doc! { "tag": "a" }, doc! { "time": 5, "tag": "a" }] {
            let err = catalog
                .insert(
                    Uuid::new_v4(),
                    &ns(),
                    Arc::new(BinaryComparator),
                    &options(),
                    doc,
                    CombinePolicy::Disallow,
                )
                .unwrap_err();
            assert_matches!(err, Error::InvalidTimeField { .. });
        }
        // nothing changed
        assert_eq!(status(&catalog).get_i64("numBuckets").unwrap(), 0);
    }

    #[test]
    fn first_commit_ships_full_extrema() {
        let catalog = BucketCatalog::default();
        let batch = insert(
            &catalog,
            &ns(),
            doc! { "time": at(10), "tag": "a", "temp": 20.0 },
        );

        assert!(batch.claim_commit_rights());
        assert!(!batch.claim_commit_rights());
        assert!(catalog.prepare_commit(&batch));

        assert_eq!(batch.num_previously_committed_measurements(), 0);
        assert_eq!(batch.min(), &doc! { "temp": 20.0, "time": at(10) });
        assert_eq!(batch.max(), &doc! { "temp": 20.0, "time": at(10) });
        assert_eq!(
            batch
                .new_field_names()
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>(),
            vec!["temp", "time"]
        );
        assert_eq!(batch.measurements().len(), 1);

        catalog.finish(&batch, ok());
        assert_eq!(batch.get_result(), Ok(ok()));

        let report = stats_doc(&catalog, &ns());
        assert_eq!(report.get_i64("numCommits").unwrap(), 1);
        assert_eq!(report.get_i64("numBucketInserts").unwrap(), 1);
        assert_eq!(report.get_i64("numBucketUpdates").unwrap(), 0);
        assert_eq!(report.get_i64("numMeasurementsCommitted").unwrap(), 1);
    }

    #[test]
    fn second_commit_ships_a_diff() {
        let catalog = BucketCatalog::default();
        let first = insert(
            &catalog,
            &ns(),
            doc! { "time": at(10), "tag": "a", "temp": 20.0 },
        );
        commit(&catalog, &first);

        let second = insert(
            &catalog,
            &ns(),
            doc! { "time": at(20), "tag": "a", "temp": 15.0 },
        );
        assert_eq!(serial_of(&second), first.bucket_id().get() & 0xFFFF_FFFF);

        assert!(second.claim_commit_rights());
        assert!(catalog.prepare_commit(&second));
        assert_eq!(second.num_previously_committed_measurements(), 1);
        // only the fields that moved appear, as a structural diff
        assert_eq!(second.min(), &doc! { "u": { "temp": 15.0 } });
        assert_eq!(second.max(), &doc! { "u": { "time": at(20) } });
        assert!(second.new_field_names().is_empty());
        catalog.finish(&second, ok());

        let report = stats_doc(&catalog, &ns());
        assert_eq!(report.get_i64("numBucketInserts").unwrap(), 1);
        assert_eq!(report.get_i64("numBucketUpdates").unwrap(), 1);
        assert_eq!(report.get_i64("avgNumMeasurementsPerCommit").unwrap(), 1);
    }

    #[test]
    fn failed_storage_write_does_not_roll_back() {
        let catalog = BucketCatalog::default();
        let first = insert(
            &catalog,
            &ns(),
            doc! { "time": at(10), "tag": "a", "temp": 20.0 },
        );
        commit(&catalog, &first);

        // the second commit folds temp=10 into the bucket, then fails
        let failed = insert(
            &catalog,
            &ns(),
            doc! { "time": at(20), "tag": "a", "temp": 10.0 },
        );
        assert!(failed.claim_commit_rights());
        assert!(catalog.prepare_commit(&failed));
        catalog.finish(
            &failed,
            CommitInfo {
                result: Err(StorageError::WriteFailed {
                    message: "boom".to_string(),
                }),
            },
        );
        assert_eq!(
            failed.get_result(),
            Ok(CommitInfo {
                result: Err(StorageError::WriteFailed {
                    message: "boom".to_string()
                })
            })
        );

        // no success counters moved, and the committed count stayed at 1
        let report = stats_doc(&catalog, &ns());
        assert_eq!(report.get_i64("numCommits").unwrap(), 1);
        assert_eq!(report.get_i64("numMeasurementsCommitted").unwrap(), 1);

        // min/max were mutated at prepare: a later commit diffs against the
        // folded-in (never stored) value and reports nothing new for temp=15
        let third = insert(
            &catalog,
            &ns(),
            doc! { "time": at(30), "tag": "a", "temp": 15.0 },
        );
        assert!(third.claim_commit_rights());
        assert!(catalog.prepare_commit(&third));
        assert_eq!(third.num_previously_committed_measurements(), 1);
        assert_eq!(third.min(), &doc! {});
        catalog.finish(&third, ok());
    }

    #[test]
    fn count_rollover_closes_the_bucket() {
        let catalog = BucketCatalog::new(CatalogConfig {
            bucket_max_count: 3,
            ..CatalogConfig::default()
        });

        let batches: Vec<_> = (0..4)
            .map(|i| {
                insert(
                    &catalog,
                    &ns(),
                    doc! { "time": at(i), "tag": "a", "v": i as i32 },
                )
            })
            .collect();

        let first_serial = serial_of(&batches[0]);
        assert_eq!(serial_of(&batches[1]), first_serial);
        assert_eq!(serial_of(&batches[2]), first_serial);
        assert_ne!(serial_of(&batches[3]), first_serial);

        let report = stats_doc(&catalog, &ns());
        assert_eq!(report.get_i64("numBucketsClosedDueToCount").unwrap(), 1);

        // the full bucket still has uncommitted batches, so it lingers
        assert_eq!(status(&catalog).get_i64("numBuckets").unwrap(), 2);

        // committing them lets the last committer reap it
        for batch in &batches[..3] {
            commit(&catalog, batch);
        }
        assert_eq!(status(&catalog).get_i64("numBuckets").unwrap(), 1);
    }

    #[test]
    fn size_rollover_closes_the_bucket() {
        let catalog = BucketCatalog::new(CatalogConfig {
            bucket_max_size: 64,
            ..CatalogConfig::default()
        });
        let b1 = insert(
            &catalog,
            &ns(),
            doc! { "time": at(0), "tag": "a", "payload": "x".repeat(40) },
        );
        let b2 = insert(
            &catalog,
            &ns(),
            doc! { "time": at(1), "tag": "a", "payload": "y".repeat(40) },
        );
        assert_ne!(serial_of(&b1), serial_of(&b2));

        let report = stats_doc(&catalog, &ns());
        assert_eq!(report.get_i64("numBucketsClosedDueToSize").unwrap(), 1);
    }

    #[test]
    fn forward_time_rollover_closes_the_bucket() {
        let catalog = BucketCatalog::default();
        let b1 = insert(&catalog, &ns(), doc! { "time": at(0), "tag": "a" });
        let b2 = insert(&catalog, &ns(), doc! { "time": at(3600), "tag": "a" });
        assert_ne!(serial_of(&b1), serial_of(&b2));

        let report = stats_doc(&catalog, &ns());
        assert_eq!(report.get_i64("numBucketsClosedDueToTimeForward").unwrap(), 1);
    }

    #[test]
    fn backward_time_rewinds_an_uncommitted_bucket() {
        let catalog = BucketCatalog::default();
        let b1 = insert(&catalog, &ns(), doc! { "time": at(1000), "tag": "a" });
        let b2 = insert(&catalog, &ns(), doc! { "time": at(900), "tag": "a" });
        assert_eq!(serial_of(&b1), serial_of(&b2));

        let report = stats_doc(&catalog, &ns());
        assert_eq!(report.get_i64("numBucketsClosedDueToTimeBackward").unwrap(), 0);

        // the bucket's nominal open time moved back with the measurement
        assert!(b2.claim_commit_rights());
        assert!(catalog.prepare_commit(&b2));
        assert_eq!(b2.bucket_id().time(), at(900));
        catalog.finish(&b2, ok());
    }

    #[test]
    fn backward_time_closes_a_committed_bucket() {
        let catalog = BucketCatalog::default();
        let b1 = insert(&catalog, &ns(), doc! { "time": at(1000), "tag": "a" });
        commit(&catalog, &b1);

        let b2 = insert(&catalog, &ns(), doc! { "time": at(900), "tag": "a" });
        assert_ne!(serial_of(&b2), b1.bucket_id().get() & 0xFFFF_FFFF);

        let report = stats_doc(&catalog, &ns());
        assert_eq!(report.get_i64("numBucketsClosedDueToTimeBackward").unwrap(), 1);
    }

    #[test]
    fn combined_sessions_share_a_batch() {
        let catalog = BucketCatalog::default();
        let insert_combined = |doc: Document| {
            catalog
                .insert(
                    Uuid::new_v4(),
                    &ns(),
                    Arc::new(BinaryComparator),
                    &options(),
                    doc,
                    CombinePolicy::Allow,
                )
                .unwrap()
        };
        let b1 = insert_combined(doc! { "time": at(0), "tag": "a", "v": 1 });
        let b2 = insert_combined(doc! { "time": at(1), "tag": "a", "v": 2 });
        assert!(Arc::ptr_eq(&b1, &b2));

        assert!(b1.claim_commit_rights());
        assert!(catalog.prepare_commit(&b1));
        assert_eq!(b1.measurements().len(), 2);
        catalog.finish(&b1, ok());
    }

    #[test]
    fn concurrent_commits_serialize_per_bucket() {
        let catalog = Arc::new(BucketCatalog::default());
        let b1 = insert(&catalog, &ns(), doc! { "time": at(0), "tag": "a", "v": 1 });
        let b2 = insert(&catalog, &ns(), doc! { "time": at(1), "tag": "a", "v": 2 });
        assert_eq!(serial_of(&b1), serial_of(&b2));

        assert!(b1.claim_commit_rights());
        assert!(b2.claim_commit_rights());
        assert!(catalog.prepare_commit(&b1));

        // the second committer has to wait for the first to finish
        let second = {
            let catalog = Arc::clone(&catalog);
            let b2 = Arc::clone(&b2);
            thread::spawn(move || {
                assert!(catalog.prepare_commit(&b2));
                catalog.finish(&b2, ok());
            })
        };

        thread::sleep(Duration::from_millis(50));
        catalog.finish(&b1, ok());
        second.join().unwrap();

        assert_eq!(b1.get_result(), Ok(ok()));
        assert_eq!(b2.get_result(), Ok(ok()));

        let report = stats_doc(&catalog, &ns());
        assert_eq!(report.get_i64("numCommits").unwrap(), 2);
        assert!(report.get_i64("numWaits").unwrap() >= 1);
    }

    #[test]
    fn clear_during_prepare_signals_a_conflict() {
        let catalog = BucketCatalog::default();
        let batch = insert(&catalog, &ns(), doc! { "time": at(0), "tag": "a" });
        assert!(batch.claim_commit_rights());
        assert!(catalog.prepare_commit(&batch));

        let err = catalog.clear_bucket(batch.bucket_id()).unwrap_err();
        assert_matches!(err, Error::WriteConflict { .. });

        // the in-flight commit still lands, then the bucket is retired
        catalog.finish(&batch, ok());
        assert_eq!(batch.get_result(), Ok(ok()));
        assert_eq!(status(&catalog).get_i64("numBuckets").unwrap(), 0);

        // a later insert opens a fresh bucket
        let next = insert(&catalog, &ns(), doc! { "time": at(1), "tag": "a" });
        assert_ne!(serial_of(&next), batch.bucket_id().get() & 0xFFFF_FFFF);
    }

    #[test]
    fn clear_of_an_unprepared_bucket_is_not_a_conflict() {
        let catalog = BucketCatalog::default();
        let batch = insert(&catalog, &ns(), doc! { "time": at(0), "tag": "a" });
        assert!(batch.claim_commit_rights());

        let handle = batch.bucket().unwrap();
        let id = handle.bucket.lock().id;
        assert_eq!(catalog.clear_bucket(id), Ok(()));

        // the cleared bucket is aborted on the next lookup for its key
        assert!(!catalog.prepare_commit(&batch));
        assert_matches!(batch.get_result(), Err(Error::BucketCleared { .. }));
    }

    #[test]
    fn abort_wakes_every_waiter() {
        let catalog = BucketCatalog::default();
        let winner = insert(&catalog, &ns(), doc! { "time": at(0), "tag": "a" });
        let loser = insert(&catalog, &ns(), doc! { "time": at(1), "tag": "a" });
        assert_eq!(serial_of(&winner), serial_of(&loser));

        assert!(winner.claim_commit_rights());
        catalog.abort(&winner);

        assert_matches!(winner.get_result(), Err(Error::BucketCleared { .. }));
        assert_matches!(loser.get_result(), Err(Error::BucketCleared { .. }));
        assert_eq!(status(&catalog).get_i64("numBuckets").unwrap(), 0);
        assert_eq!(catalog.memory_usage(), 0);
    }

    #[test]
    fn clear_namespace_aborts_only_that_namespace() {
        let catalog = BucketCatalog::default();
        let other = Namespace::new("db", "other");
        let doomed = insert(&catalog, &ns(), doc! { "time": at(0), "tag": "a" });
        let kept = insert(&catalog, &other, doc! { "time": at(0), "tag": "a" });

        catalog.clear_namespace(&ns());

        assert_matches!(doomed.get_result(), Err(Error::BucketCleared { .. }));
        assert!(!kept.finished());
        assert_eq!(status(&catalog).get_i64("numBuckets").unwrap(), 1);

        // a post-clear insert gets a new bucket, never the old one
        let fresh = insert(&catalog, &ns(), doc! { "time": at(1), "tag": "a" });
        assert_ne!(serial_of(&fresh), serial_of(&doomed));
    }

    #[test]
    fn clear_database_sweeps_every_collection() {
        let catalog = BucketCatalog::default();
        let a = Namespace::new("db", "a");
        let b = Namespace::new("db", "b");
        let other = Namespace::new("elsewhere", "c");
        insert(&catalog, &a, doc! { "time": at(0), "tag": "a" });
        insert(&catalog, &b, doc! { "time": at(0), "tag": "a" });
        insert(&catalog, &other, doc! { "time": at(0), "tag": "a" });

        catalog.clear_database("db");
        assert_eq!(status(&catalog).get_i64("numBuckets").unwrap(), 1);
    }

    #[test]
    fn committed_buckets_idle_and_revive() {
        let catalog = BucketCatalog::default();
        let batch = insert(&catalog, &ns(), doc! { "time": at(0), "tag": "a" });
        commit(&catalog, &batch);
        assert_eq!(status(&catalog).get_i64("numIdleBuckets").unwrap(), 1);

        let again = insert(&catalog, &ns(), doc! { "time": at(1), "tag": "a" });
        assert_eq!(serial_of(&again), batch.bucket_id().get() & 0xFFFF_FFFF);
        assert_eq!(status(&catalog).get_i64("numIdleBuckets").unwrap(), 0);
    }

    #[test]
    fn memory_pressure_expires_the_oldest_idle_bucket() {
        let catalog = BucketCatalog::new(CatalogConfig {
            idle_memory_threshold: 1,
            ..CatalogConfig::default()
        });

        let first = insert(&catalog, &ns(), doc! { "time": at(0), "tag": "a" });
        commit(&catalog, &first);
        assert!(catalog.memory_usage() > 1);

        // admission of the next insert evicts the idle bucket
        insert(&catalog, &ns(), doc! { "time": at(1), "tag": "b" });

        let report = stats_doc(&catalog, &ns());
        assert_eq!(
            report.get_i64("numBucketsClosedDueToMemoryThreshold").unwrap(), 1
        );
        let report = status(&catalog);
        assert_eq!(report.get_i64("numBuckets").unwrap(), 1);
        assert_eq!(report.get_i64("numIdleBuckets").unwrap(), 0);
    }

    #[test]
    fn metadata_is_readable_until_retirement() {
        let catalog = BucketCatalog::default();
        let batch = insert(
            &catalog,
            &ns(),
            doc! { "time": at(0), "tag": { "a": 1 } },
        );
        let handle = batch.bucket().unwrap();
        assert_eq!(
            catalog.get_metadata(&handle),
            Some(doc! { "tag": { "a": 1 } })
        );

        catalog.clear_namespace(&ns());
        assert_eq!(catalog.get_metadata(&handle), None);
    }

    #[test]
    fn memory_usage_returns_to_zero_when_everything_clears() {
        let catalog = BucketCatalog::default();
        for i in 0..5 {
            let batch = insert(
                &catalog,
                &ns(),
                doc! { "time": at(i), "tag": format!("t{i}") },
            );
            commit(&catalog, &batch);
        }
        assert!(catalog.memory_usage() > 0);

        catalog.clear_namespace(&ns());
        assert_eq!(catalog.memory_usage(), 0);
        assert_eq!(status(&catalog).get_i64("numBuckets").unwrap(), 0);
        assert_eq!(status(&catalog).get_i64("numIdleBuckets").unwrap(), 0);
    }
}
