//! Incremental minimum/maximum tracking over nested measurement documents.
//!
//! Each bucket keeps two trackers, one per extremum. A tracker mirrors the
//! shape of the documents folded into it: object nodes hold children by field
//! name, array nodes by position, value nodes the current extremum. Every
//! node carries a dirty bit so a commit can emit just the fields that moved
//! since the previous commit, as a structural diff.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::mem;

use bson::{Bson, Document};

use crate::bson_util::{
    self, compare_values, ARRAY_TYPE_RANK, OBJECT_TYPE_RANK,
};
use crate::types::StringComparator;

/// Field name of the replaced-values section in an emitted diff.
const UPDATE_SECTION: &str = "u";
/// Prefix of a nested sub-diff entry.
const SUB_DIFF_PREFIX: &str = "s";
/// Marker field distinguishing an array-level diff.
const ARRAY_HEADER: &str = "a";

/// Which extremum a tracker maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Extremum {
    Min,
    Max,
}

impl Extremum {
    /// Whether a candidate comparing `ord` against the current value wins.
    fn wins(&self, ord: Ordering) -> bool {
        match self {
            Self::Min => ord == Ordering::Less,
            Self::Max => ord == Ordering::Greater,
        }
    }
}

#[derive(Debug, Default)]
enum Data {
    #[default]
    Unset,
    Value(Bson),
    Object(BTreeMap<String, MinMax>),
    Array(Vec<MinMax>),
}

/// One node of the extremum tree.
#[derive(Debug, Default)]
pub(crate) struct MinMax {
    data: Data,
    updated: bool,
    memory: u64,
}

impl MinMax {
    /// Folds one measurement into the tracker, ignoring `meta_field`.
    pub(crate) fn update(
        &mut self,
        doc: &Document,
        meta_field: Option<&str>,
        comparator: &dyn StringComparator,
        extremum: Extremum,
    ) {
        assert!(
            matches!(self.data, Data::Unset | Data::Object(_)),
            "min/max root must be an object"
        );
        if !matches!(self.data, Data::Object(_)) {
            self.data = Data::Object(BTreeMap::new());
        }

        let Data::Object(children) = &mut self.data else {
            unreachable!()
        };
        for (name, value) in doc {
            if meta_field == Some(name.as_str()) {
                continue;
            }
            let child = children.entry(name.clone()).or_default();
            Self::update_entry(&mut self.memory, child, value, comparator, extremum);
        }
    }

    /// Updates `child` while keeping the parent's memory tally in step.
    fn update_entry(
        memory: &mut u64,
        child: &mut Self,
        value: &Bson,
        comparator: &dyn StringComparator,
        extremum: Extremum,
    ) {
        *memory -= child.memory_usage();
        child.update_value(value, comparator, extremum);
        *memory += child.memory_usage();
    }

    fn update_value(&mut self, value: &Bson, comparator: &dyn StringComparator, extremum: Extremum) {
        // A structural candidate merges element-wise into a node of the same
        // kind; against anything else the whole node is replaced when the
        // canonical type ranks say so.
        match value {
            Bson::Document(sub) => {
                let take = match &self.data {
                    Data::Unset | Data::Object(_) => true,
                    Data::Array(_) => extremum.wins(OBJECT_TYPE_RANK.cmp(&ARRAY_TYPE_RANK)),
                    Data::Value(current) => {
                        extremum.wins(OBJECT_TYPE_RANK.cmp(&bson_util::canonical_type(current)))
                    }
                };
                if !take {
                    return;
                }
                if !matches!(self.data, Data::Object(_)) {
                    self.data = Data::Object(BTreeMap::new());
                    self.updated = true;
                    self.memory = 0;
                }
                let Data::Object(children) = &mut self.data else {
                    unreachable!()
                };
                for (name, value) in sub {
                    let child = children.entry(name.clone()).or_default();
                    Self::update_entry(&mut self.memory, child, value, comparator, extremum);
                }
            }
            Bson::Array(values) => {
                let take = match &self.data {
                    Data::Unset | Data::Array(_) => true,
                    Data::Object(_) => extremum.wins(ARRAY_TYPE_RANK.cmp(&OBJECT_TYPE_RANK)),
                    Data::Value(current) => {
                        extremum.wins(ARRAY_TYPE_RANK.cmp(&bson_util::canonical_type(current)))
                    }
                };
                if !take {
                    return;
                }
                if !matches!(self.data, Data::Array(_)) {
                    self.data = Data::Array(Vec::new());
                    self.updated = true;
                    self.memory = 0;
                }
                let Data::Array(children) = &mut self.data else {
                    unreachable!()
                };
                if children.len() < values.len() {
                    children.resize_with(values.len(), Self::default);
                }
                for (i, value) in values.iter().enumerate() {
                    Self::update_entry(&mut self.memory, &mut children[i], value, comparator, extremum);
                }
            }
            scalar => {
                let take = match &self.data {
                    Data::Unset => true,
                    Data::Object(_) => {
                        extremum.wins(bson_util::canonical_type(scalar).cmp(&OBJECT_TYPE_RANK))
                    }
                    Data::Array(_) => {
                        extremum.wins(bson_util::canonical_type(scalar).cmp(&ARRAY_TYPE_RANK))
                    }
                    Data::Value(current) => {
                        extremum.wins(compare_values(scalar, current, comparator))
                    }
                };
                if take {
                    self.data = Data::Value(scalar.clone());
                    self.updated = true;
                    // size of the value wrapped in a single-element document
                    self.memory = bson_util::element_size("", scalar) + 5;
                }
            }
        }
    }

    /// O(1) memory estimate maintained by `update`.
    pub(crate) fn memory_usage(&self) -> u64 {
        let children = match &self.data {
            Data::Object(children) => children.len(),
            Data::Array(children) => children.len(),
            Data::Unset | Data::Value(_) => 0,
        };
        self.memory + (mem::size_of::<Self>() * children) as u64
    }

    /// Renders the full nested extremum. The root must be an object.
    pub(crate) fn to_bson(&self) -> Document {
        match self.as_bson() {
            Bson::Document(doc) => doc,
            _ => panic!("min/max root is not an object"),
        }
    }

    fn as_bson(&self) -> Bson {
        match &self.data {
            Data::Unset => panic!("cannot render an unset min/max node"),
            Data::Value(value) => value.clone(),
            Data::Object(children) => {
                let mut doc = Document::new();
                for (name, child) in children {
                    doc.insert(name.clone(), child.as_bson());
                }
                Bson::Document(doc)
            }
            Data::Array(children) => {
                Bson::Array(children.iter().map(Self::as_bson).collect())
            }
        }
    }

    /// Emits a structural diff of everything replaced since the last call
    /// and clears the dirty bits as it goes.
    ///
    /// At an object level the diff carries an update section (`"u"`) of
    /// replaced fields followed by one `"s<field>"` entry per child whose
    /// subtree changed; an array level is marked with `"a": true` and keys
    /// its entries by position instead.
    pub(crate) fn updates(&mut self) -> Document {
        assert!(
            matches!(self.data, Data::Object(_)),
            "min/max root is not an object"
        );
        let mut builder = Document::new();
        self.append_updates(&mut builder);
        builder
    }

    fn append_updates(&mut self, builder: &mut Document) -> bool {
        let mut appended = false;
        match &mut self.data {
            Data::Object(children) => {
                let mut update_section = Document::new();
                let mut sub_diffs = Vec::new();
                for (name, child) in children.iter_mut() {
                    if child.updated {
                        update_section.insert(name.clone(), child.as_bson());
                        child.clear_updated();
                        appended = true;
                    } else if !matches!(child.data, Data::Value(_) | Data::Unset) {
                        let mut sub_diff = Document::new();
                        if child.append_updates(&mut sub_diff) {
                            sub_diffs.push((format!("{SUB_DIFF_PREFIX}{name}"), sub_diff));
                            appended = true;
                        }
                    }
                }
                if !update_section.is_empty() {
                    builder.insert(UPDATE_SECTION, update_section);
                }
                // sub-diffs come after the update section
                for (name, sub_diff) in sub_diffs {
                    builder.insert(name, sub_diff);
                }
            }
            Data::Array(children) => {
                builder.insert(ARRAY_HEADER, true);
                for (i, child) in children.iter_mut().enumerate() {
                    if child.updated {
                        builder.insert(format!("{UPDATE_SECTION}{i}"), child.as_bson());
                        child.clear_updated();
                        appended = true;
                    } else if !matches!(child.data, Data::Value(_) | Data::Unset) {
                        let mut sub_diff = Document::new();
                        if child.append_updates(&mut sub_diff) {
                            builder.insert(format!("{SUB_DIFF_PREFIX}{i}"), sub_diff);
                            appended = true;
                        }
                    }
                }
            }
            Data::Unset | Data::Value(_) => unreachable!("diff emitted from a leaf node"),
        }
        appended
    }

    /// Clears the dirty bits of the whole subtree, marking the current
    /// contents as reported.
    pub(crate) fn clear_updated(&mut self) {
        self.updated = false;
        match &mut self.data {
            Data::Object(children) => {
                for child in children.values_mut() {
                    child.clear_updated();
                }
            }
            Data::Array(children) => {
                for child in children {
                    child.clear_updated();
                }
            }
            Data::Unset | Data::Value(_) => {}
        }
    }
}
