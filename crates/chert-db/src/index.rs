use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use bson::{Bson, Document};
use chert_query::Path;
use chert_store::Transaction;
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::ids::DocId;
use crate::keys;

pub(crate) const SYS_KEYSPACE: &str = "_sys";

/// Value type an index projects its path into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Str,
    I64,
    F64,
}

impl IndexKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            IndexKind::Str => b's',
            IndexKind::I64 => b'i',
            IndexKind::F64 => b'f',
        }
    }

    /// String values have no fixed encoded width, so keys carrying them
    /// need a terminator before the id tail.
    pub(crate) fn variable_length(self) -> bool {
        matches!(self, IndexKind::Str)
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKind::Str => f.write_str("STR"),
            IndexKind::I64 => f.write_str("I64"),
            IndexKind::F64 => f.write_str("F64"),
        }
    }
}

/// Index mode: value type plus uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMode {
    pub kind: IndexKind,
    pub unique: bool,
}

impl IndexMode {
    pub fn str() -> Self {
        Self {
            kind: IndexKind::Str,
            unique: false,
        }
    }

    pub fn i64() -> Self {
        Self {
            kind: IndexKind::I64,
            unique: false,
        }
    }

    pub fn f64() -> Self {
        Self {
            kind: IndexKind::F64,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Catalog key suffix, e.g. `s`, `su`, `i`, `fu`.
    pub(crate) fn meta_tag(&self) -> String {
        let mut tag = String::with_capacity(2);
        tag.push(self.kind.tag() as char);
        if self.unique {
            tag.push('u');
        }
        tag
    }
}

impl std::fmt::Display for IndexMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.unique {
            write!(f, "UNIQUE|{}", self.kind)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

/// Persisted index descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IndexMeta {
    pub path: String,
    pub kind: IndexKind,
    pub unique: bool,
}

impl IndexMeta {
    pub fn mode(&self) -> IndexMode {
        IndexMode {
            kind: self.kind,
            unique: self.unique,
        }
    }
}

/// Runtime handle of one index: descriptor, compiled path, live row count.
#[derive(Debug)]
pub(crate) struct IndexHandle {
    pub meta: IndexMeta,
    pub path: Path,
    pub rows: AtomicU64,
}

impl IndexHandle {
    pub fn new(meta: IndexMeta, rows: u64) -> Self {
        let path = Path::parse(&meta.path);
        Self {
            meta,
            path,
            rows: AtomicU64::new(rows),
        }
    }

    pub fn key_prefix(&self) -> Vec<u8> {
        keys::index_prefix(&self.meta.path, self.meta.kind)
    }

    pub fn row_count(&self) -> u64 {
        self.rows.load(AtomicOrdering::Relaxed)
    }

    /// Order-preserving encoding of one atomic value, or `None` when the
    /// value does not coerce into this index's type.
    pub fn coerce(&self, value: &Bson) -> Option<Vec<u8>> {
        match self.meta.kind {
            IndexKind::Str => match value {
                Bson::String(s) => Some(s.as_bytes().to_vec()),
                Bson::Symbol(s) => Some(s.as_bytes().to_vec()),
                Bson::Int32(n) => Some(n.to_string().into_bytes()),
                Bson::Int64(n) => Some(n.to_string().into_bytes()),
                Bson::Double(d) => Some(format_f64(*d).into_bytes()),
                Bson::Boolean(b) => Some(if *b { b"true".to_vec() } else { b"false".to_vec() }),
                _ => None,
            },
            IndexKind::I64 => {
                let n = match value {
                    Bson::Int32(n) => *n as i64,
                    Bson::Int64(n) => *n,
                    Bson::Double(d) => *d as i64,
                    Bson::Boolean(b) => *b as i64,
                    Bson::DateTime(dt) => dt.timestamp_millis(),
                    Bson::String(s) => s.parse::<i64>().ok()?,
                    _ => return None,
                };
                Some(encode_i64(n).to_vec())
            }
            IndexKind::F64 => {
                let d = match value {
                    Bson::Int32(n) => *n as f64,
                    Bson::Int64(n) => *n as f64,
                    Bson::Double(d) => *d,
                    Bson::String(s) => s.parse::<f64>().ok()?,
                    _ => return None,
                };
                Some(encode_f64(d).to_vec())
            }
        }
    }

    /// Encoded entries this document contributes to the index.
    ///
    /// Arrays expand element-wise; duplicate atoms within one document
    /// collapse to a single entry, so entry counts stay in lockstep with
    /// insert/remove pairs.
    pub fn entries_for(&self, doc: &Document) -> Vec<Vec<u8>> {
        let mut entries = Vec::new();
        for value in self.path.resolve_all(doc) {
            match value {
                Bson::Array(elems) => {
                    for elem in elems {
                        if let Some(bytes) = self.coerce(elem) {
                            entries.push(bytes);
                        }
                    }
                }
                other => {
                    if let Some(bytes) = self.coerce(other) {
                        entries.push(bytes);
                    }
                }
            }
        }
        entries.sort();
        entries.dedup();
        entries
    }
}

/// Sign-flipped big-endian i64 — orders correctly under byte comparison.
pub(crate) fn encode_i64(n: i64) -> [u8; 8] {
    ((n as u64) ^ (1u64 << 63)).to_be_bytes()
}

/// IEEE 754 reordering: flip all bits for negatives, the sign bit for
/// positives.
pub(crate) fn encode_f64(d: f64) -> [u8; 8] {
    let bits = d.to_bits();
    let sortable = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits ^ (1u64 << 63)
    };
    sortable.to_be_bytes()
}

fn format_f64(d: f64) -> String {
    if d.fract() == 0.0 && d.is_finite() && d.abs() < 9.0e18 {
        format!("{}", d as i64)
    } else {
        format!("{d}")
    }
}

/// Re-sync one index after a document transition `old → new`.
///
/// Computes the entry diff, removes stale keys, inserts fresh ones, and
/// keeps the persisted row count in step. A unique collision on insert
/// surfaces `UniqueIndexViolation`; the caller abandons the transaction,
/// which takes the document write down with it.
pub(crate) fn sync_document<T: Transaction>(
    txn: &T,
    collection: &str,
    idx: &IndexHandle,
    id: &DocId,
    old: Option<&Document>,
    new: Option<&Document>,
) -> Result<(), DbError> {
    let old_entries = old.map(|d| idx.entries_for(d)).unwrap_or_default();
    let new_entries = new.map(|d| idx.entries_for(d)).unwrap_or_default();
    if old_entries == new_entries {
        return Ok(());
    }

    let ks = txn.keyspace(collection)?;
    let prefix = idx.key_prefix();
    let mut removed = 0i64;
    let mut added = 0i64;

    for value_bytes in old_entries.iter().filter(|e| !new_entries.contains(*e)) {
        if idx.meta.unique {
            let key = keys::unique_key(&prefix, value_bytes);
            // Only drop the entry if it still points at this document.
            if let Some(stored) = txn.get(&ks, &key)? {
                if DocId::decode(&stored)? == *id {
                    txn.delete(&ks, &key)?;
                    removed += 1;
                }
            }
        } else {
            txn.delete(&ks, &keys::dup_key(&prefix, idx.meta.kind, value_bytes, id))?;
            removed += 1;
        }
    }

    for value_bytes in new_entries.iter().filter(|e| !old_entries.contains(*e)) {
        if idx.meta.unique {
            let key = keys::unique_key(&prefix, value_bytes);
            if let Some(stored) = txn.get(&ks, &key)? {
                if DocId::decode(&stored)? != *id {
                    return Err(DbError::UniqueIndexViolation {
                        collection: collection.to_string(),
                        path: idx.meta.path.clone(),
                    });
                }
                continue;
            }
            txn.put(&ks, &key, &id.encode())?;
        } else {
            txn.put(
                &ks,
                &keys::dup_key(&prefix, idx.meta.kind, value_bytes, id),
                &[],
            )?;
        }
        added += 1;
    }

    // The in-memory counter is a planner cardinality estimate. It is
    // persisted with the transaction and reconciled from the stored
    // value on open, so a rolled-back transaction can leave it slightly
    // ahead until then.
    let delta = added - removed;
    if delta != 0 {
        let rows = if delta > 0 {
            idx.rows.fetch_add(delta as u64, AtomicOrdering::Relaxed) + delta as u64
        } else {
            idx.rows
                .fetch_sub((-delta) as u64, AtomicOrdering::Relaxed)
                .saturating_sub((-delta) as u64)
        };
        let sys = txn.keyspace(SYS_KEYSPACE)?;
        let count_key =
            keys::index_count_key(collection, &idx.meta.path, &idx.meta.mode().meta_tag());
        txn.put(&sys, &count_key, &rows.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn handle(kind: IndexKind, unique: bool) -> IndexHandle {
        IndexHandle::new(
            IndexMeta {
                path: "tags".into(),
                kind,
                unique,
            },
            0,
        )
    }

    #[test]
    fn entries_expand_arrays_and_dedup_atoms() {
        let idx = handle(IndexKind::Str, false);
        let doc = doc! { "tags": ["red", "blue", "red"] };
        let entries = idx.entries_for(&doc);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn scalar_field_contributes_one_entry() {
        let idx = handle(IndexKind::Str, false);
        let doc = doc! { "tags": "solo" };
        assert_eq!(idx.entries_for(&doc).len(), 1);
    }

    #[test]
    fn missing_path_contributes_nothing() {
        let idx = handle(IndexKind::Str, false);
        assert!(idx.entries_for(&doc! { "other": 1 }).is_empty());
    }

    #[test]
    fn i64_coercion_accepts_numerics_and_numeric_strings() {
        let idx = handle(IndexKind::I64, false);
        assert!(idx.coerce(&Bson::Int32(5)).is_some());
        assert!(idx.coerce(&Bson::Double(5.9)).is_some());
        assert!(idx.coerce(&Bson::String("42".into())).is_some());
        assert!(idx.coerce(&Bson::String("nope".into())).is_none());
    }

    #[test]
    fn f64_encoding_orders_negatives_correctly() {
        let values = [-10.5, -0.5, 0.0, 0.333, 0.93, 1.0, 10.0];
        let mut encoded: Vec<[u8; 8]> = values.iter().map(|v| encode_f64(*v)).collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn i64_encoding_orders_across_sign() {
        let values = [i64::MIN, -7, 0, 3, i64::MAX];
        let encoded: Vec<[u8; 8]> = values.iter().map(|v| encode_i64(*v)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }
}
