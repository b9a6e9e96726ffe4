//! Scoped bucket lookup.
//!
//! `BucketAccess` is the only way into a bucket's mutable state: it finds the
//! bucket under the catalog's stripe lock, takes the bucket's own mutex,
//! validates the bucket's lifecycle state, and then drops the stripe lock
//! while keeping the bucket locked. While a guard is held the bucket cannot
//! be removed and is not in the idle list.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;

use crate::bucket::{Bucket, BucketHandle, SharedBucket};
use crate::catalog::{BucketCatalog, Stripe};
use crate::metadata::BucketKey;
use crate::state::BucketState;
use crate::stats::ExecutionStats;

pub(crate) type BucketGuard = ArcMutexGuard<RawMutex, Bucket>;

/// Context of a key lookup, needed again for rollover and time rewinds.
struct Target<'a> {
    key: &'a BucketKey,
    stats: &'a Arc<ExecutionStats>,
    time: bson::DateTime,
}

pub(crate) struct BucketAccess<'a> {
    catalog: &'a BucketCatalog,
    target: Option<Target<'a>>,
    stripe_index: usize,
    bucket: Option<SharedBucket>,
    guard: Option<BucketGuard>,
}

impl<'a> BucketAccess<'a> {
    /// Finds or creates the open bucket for `key` and locks it.
    ///
    /// The fast path takes the key's stripe in shared mode and succeeds when
    /// the open bucket is normal or prepared. Otherwise the stripe is
    /// re-taken exclusively and the lookup re-run, aborting a cleared bucket
    /// and allocating a fresh one as needed.
    pub(crate) fn for_key(
        catalog: &'a BucketCatalog,
        key: &'a BucketKey,
        stats: &'a Arc<ExecutionStats>,
        time: bson::DateTime,
    ) -> Self {
        // hash outside any lock
        let stripe_index = catalog.stripe_index(key);
        let mut access = Self {
            catalog,
            target: Some(Target { key, stats, time }),
            stripe_index,
            bucket: None,
            guard: None,
        };

        {
            let stripe = catalog.stripes[stripe_index].read();
            if let Some(state) = access.find_open_and_lock(&stripe) {
                if matches!(state, BucketState::Normal | BucketState::Prepared) {
                    drop(stripe);
                    return access;
                }
            }
        }

        let mut stripe = catalog.stripes[stripe_index].write();
        access.find_or_create_and_lock(&mut stripe);
        access
    }

    /// Re-acquires a bucket already referenced by a commit-path handle.
    /// Yields an unlocked access when the bucket has been retired or
    /// cleared.
    pub(crate) fn for_bucket(catalog: &'a BucketCatalog, handle: &BucketHandle) -> Self {
        let mut access = Self {
            catalog,
            target: None,
            stripe_index: handle.stripe,
            bucket: None,
            guard: None,
        };

        let stripe = catalog.stripes[handle.stripe].read();
        if !stripe.buckets.contains_key(&handle.serial) {
            return access;
        }
        access.acquire(Arc::clone(&handle.bucket));

        let state = catalog
            .states
            .get(access.id)
            .expect("live bucket has no state entry");
        if state == BucketState::Cleared {
            access.release();
        }
        access
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.guard.is_some()
    }

    /// Unlocks the bucket and nullifies the guard.
    pub(crate) fn release(&mut self) {
        self.guard = None;
        self.bucket = None;
    }

    pub(crate) fn handle(&self) -> BucketHandle {
        let bucket = self.bucket.as_ref().expect("bucket access is not locked");
        let guard = self.guard.as_ref().expect("bucket access is not locked");
        BucketHandle {
            serial: guard.serial,
            stripe: guard.stripe,
            bucket: Arc::clone(bucket),
        }
    }

    /// Closes the current (full) bucket for the key and moves the guard to
    /// its successor.
    ///
    /// Re-finds the open bucket under the exclusive stripe and re-evaluates
    /// `is_full` to avoid double-closing behind a racing rollover. The old
    /// bucket is removed outright when nothing in it is awaiting commit;
    /// otherwise it is marked full so its last committer reaps it.
    pub(crate) fn rollover(&mut self, mut is_full: impl FnMut(&mut Self) -> bool) {
        assert!(self.is_locked(), "rollover without a locked bucket");
        let old_serial = self.serial;
        self.release();

        let mut stripe = self.catalog.stripes[self.stripe_index].write();
        self.find_or_create_and_lock(&mut stripe);

        // Only act (and count stats) if no one else rolled the key over
        // while the locks were down.
        let same_bucket = self.serial == old_serial;
        if same_bucket || is_full(self) {
            if self.all_committed() {
                let guard = self.guard.take().expect("bucket was locked");
                self.bucket = None;
                let removed = self.catalog.remove_bucket_locked(&mut stripe, guard);
                debug_assert!(removed, "open bucket vanished during rollover");
            } else {
                self.full = true;
                self.release();
            }
            self.create(&mut stripe, false);
        }
    }

    /// Rewinds the bucket's nominal open time to the lookup time, re-keying
    /// its identity and state entry.
    pub(crate) fn rewind_time(&mut self) {
        let time = self
            .target
            .as_ref()
            .expect("rewind outside a key lookup")
            .time;
        let old = self.id;
        let new = old.with_time(time);
        self.id = new;
        self.catalog.states.rekey(old, new);
    }

    fn acquire(&mut self, bucket: SharedBucket) {
        self.guard = Some(bucket.lock_arc());
        self.bucket = Some(bucket);
    }

    /// Fast-path lookup under a shared stripe. Returns the bucket's state,
    /// or `None` when the key has no open bucket; the guard is only kept for
    /// usable states.
    fn find_open_and_lock(&mut self, stripe: &Stripe) -> Option<BucketState> {
        let key = self.target.as_ref().expect("key lookup without a target").key;
        let bucket = Arc::clone(stripe.open_buckets.get(key)?);
        self.acquire(bucket);

        let state = self
            .catalog
            .states
            .get(self.id)
            .expect("open bucket has no state entry");
        if matches!(state, BucketState::Cleared | BucketState::PreparedAndCleared) {
            self.release();
        } else {
            let catalog = self.catalog;
            catalog.mark_bucket_not_idle(self.guard_mut());
        }
        Some(state)
    }

    /// Slow-path lookup under the exclusive stripe: reuse a healthy open
    /// bucket, abort and replace a cleared one, or allocate the first.
    fn find_or_create_and_lock(&mut self, stripe: &mut Stripe) {
        let key = self.target.as_ref().expect("key lookup without a target").key;
        let Some(bucket) = stripe.open_buckets.get(key).map(Arc::clone) else {
            self.create(stripe, true);
            return;
        };
        self.acquire(bucket);

        let state = self
            .catalog
            .states
            .get(self.id)
            .expect("open bucket has no state entry");
        if matches!(state, BucketState::Normal | BucketState::Prepared) {
            let catalog = self.catalog;
            catalog.mark_bucket_not_idle(self.guard_mut());
            return;
        }

        // the open bucket was cleared behind our back
        let guard = self.guard.take().expect("bucket was locked");
        self.bucket = None;
        self.catalog.abort_bucket_locked(stripe, guard, None);
        self.create(stripe, true);
    }

    fn create(&mut self, stripe: &mut Stripe, opened_due_to_metadata: bool) {
        let target = self.target.as_ref().expect("create outside a key lookup");
        let bucket =
            self.catalog
                .allocate_bucket(stripe, self.stripe_index, target.key, target.time);
        if opened_due_to_metadata {
            target
                .stats
                .num_buckets_opened_due_to_metadata
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        self.acquire(bucket);
    }

    fn guard_mut(&mut self) -> &mut Bucket {
        self.guard.as_deref_mut().expect("bucket access is not locked")
    }
}

impl Deref for BucketAccess<'_> {
    type Target = Bucket;

    fn deref(&self) -> &Bucket {
        self.guard.as_deref().expect("bucket access is not locked")
    }
}

impl DerefMut for BucketAccess<'_> {
    fn deref_mut(&mut self) -> &mut Bucket {
        self.guard_mut()
    }
}
