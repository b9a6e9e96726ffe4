//! Bucket metadata normalization and the key identifying an open bucket.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bson::Document;

use crate::bson_util;
use crate::types::{Namespace, StringComparator};

/// The metadata sub-document partitioning measurements into buckets.
///
/// Keeps the original value for callers, plus a recursively key-sorted copy
/// that equality and hashing run against, so metadata values differing only
/// in field order land in the same bucket.
#[derive(Debug, Clone)]
pub struct BucketMetadata {
    original: Document,
    normalized: Document,
    comparator: Arc<dyn StringComparator>,
}

impl BucketMetadata {
    pub(crate) fn new(metadata: Document, comparator: Arc<dyn StringComparator>) -> Self {
        let normalized = bson_util::normalized(&metadata);
        Self {
            original: metadata,
            normalized,
            comparator,
        }
    }

    /// The metadata as originally supplied, field order preserved.
    pub(crate) fn to_document(&self) -> &Document {
        &self.original
    }

    /// Name of the metadata field, if the collection has one.
    pub(crate) fn meta_field(&self) -> Option<&str> {
        self.original.keys().next().map(String::as_str)
    }

    pub(crate) fn comparator(&self) -> &Arc<dyn StringComparator> {
        &self.comparator
    }

    /// Serialized size of the original metadata, for memory accounting.
    pub(crate) fn size(&self) -> u64 {
        bson_util::document_size(&self.original)
    }
}

impl PartialEq for BucketMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for BucketMetadata {}

impl Hash for BucketMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        bson_util::hash_document(&self.normalized, state);
    }
}

/// Identifies the single open bucket eligible to accept a new measurement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BucketKey {
    pub(crate) ns: Namespace,
    pub(crate) metadata: BucketMetadata,
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use bson::doc;

    use crate::types::BinaryComparator;

    use super::*;

    fn metadata(doc: Document) -> BucketMetadata {
        BucketMetadata::new(doc, Arc::new(BinaryComparator))
    }

    fn hash_of(m: &BucketMetadata) -> u64 {
        let mut hasher = DefaultHasher::new();
        m.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn field_order_does_not_split_metadata() {
        let a = metadata(doc! { "tag": { "a": 1, "b": 2 } });
        let b = metadata(doc! { "tag": { "b": 2, "a": 1 } });
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn different_values_split_metadata() {
        let a = metadata(doc! { "tag": "x" });
        let b = metadata(doc! { "tag": "y" });
        assert_ne!(a, b);
    }

    #[test]
    fn original_form_is_preserved() {
        let m = metadata(doc! { "tag": { "b": 2, "a": 1 } });
        assert_eq!(
            m.to_document()["tag"].as_document().unwrap().keys().collect::<Vec<_>>(),
            vec!["b", "a"]
        );
        assert_eq!(m.meta_field(), Some("tag"));
    }

    #[test]
    fn empty_metadata_has_no_meta_field() {
        let m = metadata(doc! {});
        assert_eq!(m.meta_field(), None);
        assert_eq!(m.size(), 5);
    }

    #[test]
    fn keys_with_equal_metadata_are_equal() {
        let key_a = BucketKey {
            ns: Namespace::new("db", "coll"),
            metadata: metadata(doc! { "tag": { "a": 1, "b": 2 } }),
        };
        let key_b = BucketKey {
            ns: Namespace::new("db", "coll"),
            metadata: metadata(doc! { "tag": { "b": 2, "a": 1 } }),
        };
        assert_eq!(key_a, key_b);

        let other_ns = BucketKey {
            ns: Namespace::new("db", "other"),
            metadata: key_a.metadata.clone(),
        };
        assert_ne!(key_a, other_ns);
    }
}
