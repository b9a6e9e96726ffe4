//! Small shared types: namespaces, bucket identities, session ids and the
//! configuration surface of the catalog.

use std::{cmp::Ordering, fmt};

/// Identifies one time-series collection as a database / collection pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.db
    }

    pub fn collection(&self) -> &str {
        &self.coll
    }

    /// Length of the rendered `db.coll` form, used for memory accounting.
    pub(crate) fn size(&self) -> u64 {
        (self.db.len() + 1 + self.coll.len()) as u64
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Stable allocation identity of a bucket. Unlike [`BucketId`] it never
/// changes over the bucket's lifetime and keys the catalog's live set.
pub(crate) type BucketSerial = u64;

/// Public bucket identity. The high 32 bits encode the bucket's nominal open
/// time in seconds since the epoch, the low 32 bits the allocation serial.
/// Rewinding a bucket's open time produces a new id with the same low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(u64);

impl BucketId {
    pub(crate) fn new(time: bson::DateTime, serial: BucketSerial) -> Self {
        Self(0).with_serial(serial).with_time(time)
    }

    pub(crate) fn with_time(self, time: bson::DateTime) -> Self {
        let secs = time.timestamp_millis().div_euclid(1000) as u64;
        Self((secs << 32) | (self.0 & 0xFFFF_FFFF))
    }

    fn with_serial(self, serial: BucketSerial) -> Self {
        Self((self.0 & !0xFFFF_FFFF) | (serial & 0xFFFF_FFFF))
    }

    /// The nominal open time encoded in the id, at second granularity.
    pub fn time(&self) -> bson::DateTime {
        bson::DateTime::from_millis((self.0 >> 32) as i64 * 1000)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifies the client session a write batch belongs to.
pub type SessionId = uuid::Uuid;

/// Whether measurements from different client sessions may be combined into
/// a single write batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinePolicy {
    /// All clients share one common session; their batches merge.
    Allow,
    /// Each client batches under its own session id.
    Disallow,
}

/// Per-insert bucketing options for a time-series collection.
#[derive(Debug, Clone)]
pub struct BucketingOptions {
    /// Name of the top-level field carrying the measurement time. The field
    /// must be present and hold a BSON datetime.
    pub time_field: String,
    /// Optional name of the top-level field partitioning measurements into
    /// separate buckets.
    pub meta_field: Option<String>,
    /// Maximum time span covered by a single bucket.
    pub bucket_max_span_seconds: u32,
}

/// Catalog-wide limits.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Maximum number of measurements per bucket.
    pub bucket_max_count: u32,
    /// Maximum serialized size of a bucket, in bytes.
    pub bucket_max_size: u64,
    /// Memory usage above which idle buckets are expired at insert time.
    pub idle_memory_threshold: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            bucket_max_count: 1000,
            bucket_max_size: 125 * 1024,
            idle_memory_threshold: 100 * 1024 * 1024,
        }
    }
}

/// Collation hook for string comparisons inside measurement values.
pub trait StringComparator: fmt::Debug + Send + Sync {
    fn compare(&self, a: &str, b: &str) -> Ordering;
}

/// Byte-order comparator, used when a collection has no collation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryComparator;

impl StringComparator for BinaryComparator {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        a.cmp(b)
    }
}
