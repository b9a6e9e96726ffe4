//! BSON helpers: canonical type ordering, cross-type value comparison,
//! wire-format sizing and key normalization.
//!
//! Sizes are computed from the wire format directly rather than by
//! serializing, so the insert hot path carries no error plumbing.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use bson::{doc, Bson, Document};

use crate::types::StringComparator;

/// Canonical rank of an embedded document.
pub(crate) const OBJECT_TYPE_RANK: i32 = 20;
/// Canonical rank of an array.
pub(crate) const ARRAY_TYPE_RANK: i32 = 25;

/// Canonical type rank. Values of different BSON types order by this rank
/// before their contents are ever looked at; all numeric types share one
/// rank, as do strings and symbols.
pub(crate) fn canonical_type(value: &Bson) -> i32 {
    match value {
        Bson::MinKey => -1,
        Bson::Undefined => 0,
        Bson::Null => 5,
        Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_) => 10,
        Bson::String(_) | Bson::Symbol(_) => 15,
        Bson::Document(_) => OBJECT_TYPE_RANK,
        Bson::Array(_) => ARRAY_TYPE_RANK,
        Bson::Binary(_) => 30,
        Bson::ObjectId(_) => 35,
        Bson::Boolean(_) => 40,
        Bson::DateTime(_) => 45,
        Bson::Timestamp(_) => 47,
        Bson::RegularExpression(_) => 50,
        Bson::DbPointer(_) => 55,
        Bson::JavaScriptCode(_) => 60,
        Bson::JavaScriptCodeWithScope(_) => 65,
        Bson::MaxKey => 127,
    }
}

/// Total order over BSON values: canonical type rank first, then contents.
/// Strings and symbols go through the supplied comparator; numeric types
/// compare across `Int32`/`Int64`/`Double`/`Decimal128`.
pub(crate) fn compare_values(a: &Bson, b: &Bson, comparator: &dyn StringComparator) -> Ordering {
    let rank = canonical_type(a).cmp(&canonical_type(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Bson::MinKey | Bson::MaxKey | Bson::Null | Bson::Undefined, _) => Ordering::Equal,
        (Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_), _) => {
            compare_numbers(a, b)
        }
        (Bson::String(x) | Bson::Symbol(x), Bson::String(y) | Bson::Symbol(y)) => {
            comparator.compare(x, y)
        }
        (Bson::Document(x), Bson::Document(y)) => compare_documents(x, y, comparator),
        (Bson::Array(x), Bson::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare_values(ex, ey, comparator);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then(u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            x.time.cmp(&y.time).then(x.increment.cmp(&y.increment))
        }
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => {
            x.pattern.cmp(&y.pattern).then_with(|| x.options.cmp(&y.options))
        }
        (Bson::JavaScriptCode(x), Bson::JavaScriptCode(y)) => x.cmp(y),
        (Bson::JavaScriptCodeWithScope(x), Bson::JavaScriptCodeWithScope(y)) => x
            .code
            .cmp(&y.code)
            .then_with(|| compare_documents(&x.scope, &y.scope, comparator)),
        // deprecated type without public accessors; treat as tied
        (Bson::DbPointer(_), Bson::DbPointer(_)) => Ordering::Equal,
        _ => Ordering::Equal,
    }
}

fn compare_documents(a: &Document, b: &Document, comparator: &dyn StringComparator) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        let ord = ka.cmp(kb).then_with(|| compare_values(va, vb, comparator));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn compare_numbers(a: &Bson, b: &Bson) -> Ordering {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
        (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
        (Bson::Int32(x), Bson::Int64(y)) => i64::from(*x).cmp(y),
        (Bson::Int64(x), Bson::Int32(y)) => x.cmp(&i64::from(*y)),
        _ => compare_doubles(numeric_value(a), numeric_value(b)),
    }
}

/// NaN orders below every number, matching the canonical BSON sort order.
fn compare_doubles(x: f64, y: f64) -> Ordering {
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

fn numeric_value(value: &Bson) -> f64 {
    match value {
        Bson::Double(d) => *d,
        Bson::Int32(i) => f64::from(*i),
        Bson::Int64(i) => *i as f64,
        Bson::Decimal128(d) => d.to_string().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// Wire-format size of a single element: type byte, name, nul, value.
pub(crate) fn element_size(name: &str, value: &Bson) -> u64 {
    1 + name.len() as u64 + 1 + value_size(value)
}

/// Wire-format size of a document: length prefix, elements, terminator.
pub(crate) fn document_size(doc: &Document) -> u64 {
    5 + doc.iter().map(|(k, v)| element_size(k, v)).sum::<u64>()
}

fn array_size(values: &[Bson]) -> u64 {
    5 + values
        .iter()
        .enumerate()
        .map(|(i, v)| element_size(&i.to_string(), v))
        .sum::<u64>()
}

/// Wire-format size of an element value, excluding the name and type byte.
pub(crate) fn value_size(value: &Bson) -> u64 {
    match value {
        Bson::Double(_) => 8,
        Bson::String(s) | Bson::Symbol(s) | Bson::JavaScriptCode(s) => 4 + s.len() as u64 + 1,
        Bson::Document(d) => document_size(d),
        Bson::Array(a) => array_size(a),
        Bson::Binary(b) => {
            // the legacy binary subtype nests a second length prefix
            let legacy = matches!(b.subtype, bson::spec::BinarySubtype::BinaryOld);
            4 + 1 + b.bytes.len() as u64 + if legacy { 4 } else { 0 }
        }
        Bson::Undefined | Bson::Null | Bson::MinKey | Bson::MaxKey => 0,
        Bson::ObjectId(_) => 12,
        Bson::Boolean(_) => 1,
        Bson::DateTime(_) | Bson::Timestamp(_) | Bson::Int64(_) => 8,
        Bson::Int32(_) => 4,
        Bson::Decimal128(_) => 16,
        Bson::RegularExpression(r) => r.pattern.len() as u64 + 1 + r.options.len() as u64 + 1,
        Bson::JavaScriptCodeWithScope(c) => {
            4 + (4 + c.code.len() as u64 + 1) + document_size(&c.scope)
        }
        // deprecated type without public accessors; size it by encoding
        Bson::DbPointer(p) => bson::to_vec(&doc! { "v": Bson::DbPointer(p.clone()) })
            .map(|bytes| bytes.len() as u64 - 8)
            .unwrap_or(0),
    }
}

/// Recursively sorts a document's keys in byte order. Sub-documents are
/// normalized too; arrays are left untouched. Two metadata values that differ
/// only in field order normalize to the same document.
pub(crate) fn normalized(doc: &Document) -> Document {
    let mut fields: Vec<(&String, &Bson)> = doc.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = Document::new();
    for (name, value) in fields {
        match value {
            Bson::Document(sub) => out.insert(name.clone(), normalized(sub)),
            other => out.insert(name.clone(), other.clone()),
        };
    }
    out
}

/// Structural hash of a document, consistent with `Document`'s equality.
pub(crate) fn hash_document<H: Hasher>(doc: &Document, state: &mut H) {
    doc.len().hash(state);
    for (name, value) in doc {
        name.hash(state);
        hash_value(value, state);
    }
}

fn hash_value<H: Hasher>(value: &Bson, state: &mut H) {
    (value.element_type() as u8).hash(state);
    match value {
        Bson::Double(d) => d.to_bits().hash(state),
        Bson::String(s) | Bson::Symbol(s) | Bson::JavaScriptCode(s) => s.hash(state),
        Bson::Document(d) => hash_document(d, state),
        Bson::Array(a) => {
            a.len().hash(state);
            for v in a {
                hash_value(v, state);
            }
        }
        Bson::Binary(b) => {
            u8::from(b.subtype).hash(state);
            b.bytes.hash(state);
        }
        Bson::ObjectId(oid) => oid.bytes().hash(state),
        Bson::Boolean(b) => b.hash(state),
        Bson::DateTime(dt) => dt.timestamp_millis().hash(state),
        Bson::Timestamp(ts) => {
            ts.time.hash(state);
            ts.increment.hash(state);
        }
        Bson::Int32(i) => i.hash(state),
        Bson::Int64(i) => i.hash(state),
        Bson::Decimal128(d) => d.bytes().hash(state),
        Bson::RegularExpression(r) => {
            r.pattern.hash(state);
            r.options.hash(state);
        }
        Bson::JavaScriptCodeWithScope(c) => {
            c.code.hash(state);
            hash_document(&c.scope, state);
        }
        // the type tag above is enough for the remaining unit-like values
        Bson::Null | Bson::Undefined | Bson::MinKey | Bson::MaxKey | Bson::DbPointer(_) => {}
    }
}

/// Number of decimal digits, with `digits(0) == 0` (an empty bucket has no
/// row index yet).
pub(crate) fn num_digits(mut n: u32) -> u32 {
    let mut digits = 0;
    while n != 0 {
        n /= 10;
        digits += 1;
    }
    digits
}
