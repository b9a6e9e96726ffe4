//! One open or closing group of measurements.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use bson::{Bson, Document};
use parking_lot::Mutex;

use crate::bson_util;
use crate::metadata::BucketKey;
use crate::min_max::MinMax;
use crate::stats::ExecutionStats;
use crate::batch::WriteBatch;
use crate::types::{BucketId, BucketSerial, Namespace, SessionId};

pub(crate) type SharedBucket = Arc<Mutex<Bucket>>;

/// Handle to a bucket in the catalog's live set.
///
/// Holding one does not pin the bucket in the catalog; every use re-validates
/// membership under the owning stripe lock before the bucket is touched.
#[derive(Debug, Clone)]
pub struct BucketHandle {
    pub(crate) serial: BucketSerial,
    pub(crate) stripe: usize,
    pub(crate) bucket: SharedBucket,
}

/// Incremental cost of admitting one measurement into a bucket.
#[derive(Debug, Default)]
pub(crate) struct SizeChange {
    /// Top-level field names the bucket has not committed yet.
    pub(crate) new_field_names: BTreeSet<String>,
    /// Bytes of those field names, including their nul terminators.
    pub(crate) field_name_bytes: u64,
    /// Growth of the bucket's serialized size under the columnar encoding.
    pub(crate) size: u64,
}

/// Mutable state of one bucket. Every access happens under the bucket's own
/// mutex, reached through a `BucketAccess` guard.
#[derive(Debug)]
pub(crate) struct Bucket {
    /// Stable allocation identity; keys the live set and never changes.
    pub(crate) serial: BucketSerial,
    /// Index of the stripe whose shard owns this bucket.
    pub(crate) stripe: usize,
    /// Public identity; rewinding the open time replaces it.
    pub(crate) id: BucketId,
    /// Namespace and metadata, set by the first insert.
    pub(crate) key: Option<BucketKey>,
    /// Top-level field names that have been committed into the bucket.
    pub(crate) field_names: HashSet<String>,
    pub(crate) num_measurements: u32,
    pub(crate) num_committed_measurements: u32,
    /// Accumulated serialized size under the on-disk encoding.
    pub(crate) size: u64,
    /// Latest measurement time observed.
    pub(crate) latest_time: bson::DateTime,
    /// Active batches by client session.
    pub(crate) batches: HashMap<SessionId, Arc<WriteBatch>>,
    /// The batch currently selected to commit, if any.
    pub(crate) prepared_batch: Option<Arc<WriteBatch>>,
    /// Set when a rollover closed the bucket; its last committer reaps it.
    pub(crate) full: bool,
    pub(crate) min: MinMax,
    pub(crate) max: MinMax,
    pub(crate) memory_usage: u64,
    /// Entry token in the catalog's idle list, when idle.
    pub(crate) idle_token: Option<u64>,
}

impl Bucket {
    pub(crate) fn new(serial: BucketSerial, stripe: usize, id: BucketId) -> Self {
        Self {
            serial,
            stripe,
            id,
            key: None,
            field_names: HashSet::new(),
            num_measurements: 0,
            num_committed_measurements: 0,
            size: 0,
            latest_time: bson::DateTime::from_millis(i64::MIN),
            batches: HashMap::new(),
            prepared_batch: None,
            full: false,
            min: MinMax::default(),
            max: MinMax::default(),
            memory_usage: 0,
            idle_token: None,
        }
    }

    /// The bucket's nominal open time, encoded in its id.
    pub(crate) fn open_time(&self) -> bson::DateTime {
        self.id.time()
    }

    /// No batch is active and none is prepared.
    pub(crate) fn all_committed(&self) -> bool {
        self.batches.is_empty() && self.prepared_batch.is_none()
    }

    pub(crate) fn has_been_committed(&self) -> bool {
        self.num_committed_measurements != 0 || self.prepared_batch.is_some()
    }

    /// Computes, for a candidate measurement, the not-yet-committed field
    /// names it introduces and the growth of the bucket's serialized size.
    ///
    /// Under the on-disk encoding each measurement is split per field and
    /// stored under its row index, so an element contributes its value plus
    /// the decimal width of the index in place of its field name; a new
    /// field additionally opens an empty column document.
    pub(crate) fn calculate_bucket_fields_and_size_change(
        &self,
        doc: &Document,
        meta_field: Option<&str>,
    ) -> SizeChange {
        let mut change = SizeChange::default();
        let index_width = u64::from(bson_util::num_digits(self.num_measurements));
        for (name, value) in doc {
            if meta_field == Some(name.as_str()) {
                // the metadata field is not stored per measurement
                continue;
            }
            if !self.field_names.contains(name) {
                change.field_name_bytes += name.len() as u64 + 1;
                change.size +=
                    bson_util::element_size(name, &Bson::Document(Document::new())) + 5;
                change.new_field_names.insert(name.clone());
            }
            // stored under the row index instead of the field name: value
            // plus index digits, type byte and the index's nul terminator
            change.size += bson_util::value_size(value) + index_width + 2;
        }
        change
    }

    /// Returns the session's batch, creating it on first use.
    pub(crate) fn active_batch(
        &mut self,
        session_id: SessionId,
        ns: &Namespace,
        stats: &Arc<ExecutionStats>,
        handle: &BucketHandle,
    ) -> Arc<WriteBatch> {
        Arc::clone(self.batches.entry(session_id).or_insert_with(|| {
            Arc::new(WriteBatch::new(
                handle.clone(),
                session_id,
                ns.clone(),
                Arc::clone(stats),
            ))
        }))
    }
}
