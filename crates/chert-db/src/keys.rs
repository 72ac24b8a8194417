//! Key layouts for the per-collection keyspace and the `_sys` catalog.
//!
//! Collection keyspace:
//!   `r\x00[id]`                                → document bytes
//!   `i\x00{path}\x00{kind}\x00{value}…`        → index entries (see below)
//!
//! Unique index entry:    key = prefix + value_bytes, value = encoded id.
//! Duplicate index entry: key = prefix + value_bytes (+ `\x00` for string
//! kinds) + trailing id block, value = empty. Equal values cluster and
//! scan in id order because the id tail is order-preserving.

use crate::ids::DocId;
use crate::index::IndexKind;

const RECORD_TAG: u8 = b'r';
const INDEX_TAG: u8 = b'i';
const SEP: u8 = 0x00;

pub fn record_key(id: &DocId) -> Vec<u8> {
    let mut key = vec![RECORD_TAG, SEP];
    key.extend_from_slice(&id.encode());
    key
}

pub fn record_prefix() -> Vec<u8> {
    vec![RECORD_TAG, SEP]
}

/// Prefix of all records with i64 ids — used to recover the id sequence
/// from the last numeric key on open.
pub fn record_i64_prefix() -> Vec<u8> {
    vec![RECORD_TAG, SEP, 0x12]
}

pub fn parse_record_key(key: &[u8]) -> Option<DocId> {
    let rest = key.strip_prefix(&[RECORD_TAG, SEP][..])?;
    DocId::decode(rest).ok()
}

/// `i\x00{path}\x00{kind}\x00` — the keyspace region of one index.
pub fn index_prefix(path: &str, kind: IndexKind) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + path.len());
    key.push(INDEX_TAG);
    key.push(SEP);
    key.extend_from_slice(path.as_bytes());
    key.push(SEP);
    key.push(kind.tag());
    key.push(SEP);
    key
}

/// Unique-index key: prefix + encoded value.
pub fn unique_key(prefix: &[u8], value_bytes: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + value_bytes.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(value_bytes);
    key
}

/// Duplicate-index key: prefix + encoded value (+ terminator for
/// variable-length kinds) + trailing id block.
pub fn dup_key(prefix: &[u8], kind: IndexKind, value_bytes: &[u8], id: &DocId) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + value_bytes.len() + 16);
    key.extend_from_slice(prefix);
    key.extend_from_slice(value_bytes);
    if kind.variable_length() {
        key.push(SEP);
    }
    id.append_tail(&mut key);
    key
}

/// Prefix matching every duplicate entry with exactly this value.
pub fn dup_value_prefix(prefix: &[u8], kind: IndexKind, value_bytes: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + value_bytes.len() + 1);
    key.extend_from_slice(prefix);
    key.extend_from_slice(value_bytes);
    if kind.variable_length() {
        key.push(SEP);
    }
    key
}

/// Extract `(value_bytes, id)` from a duplicate-index key.
pub fn parse_dup_key<'k>(
    key: &'k [u8],
    prefix: &[u8],
    kind: IndexKind,
) -> Option<(&'k [u8], DocId)> {
    let rest = key.strip_prefix(prefix)?;
    let (mut value, id) = DocId::split_tail(rest).ok()?;
    if kind.variable_length() {
        value = value.strip_suffix(&[SEP][..])?;
    }
    Some((value, id))
}

/// Extract `value_bytes` from a unique-index key.
pub fn parse_unique_key<'k>(key: &'k [u8], prefix: &[u8]) -> Option<&'k [u8]> {
    key.strip_prefix(prefix)
}

// ── `_sys` catalog keys ─────────────────────────────────────────

pub fn collection_meta_key(name: &str) -> Vec<u8> {
    format!("c.{name}").into_bytes()
}

pub fn collection_meta_prefix() -> Vec<u8> {
    b"c.".to_vec()
}

pub fn index_meta_key(collection: &str, path: &str, mode_tag: &str) -> Vec<u8> {
    format!("i.{collection}.{path}.{mode_tag}").into_bytes()
}

pub fn index_meta_prefix(collection: &str) -> Vec<u8> {
    format!("i.{collection}.").into_bytes()
}

pub fn collection_count_key(name: &str) -> Vec<u8> {
    format!("n.{name}").into_bytes()
}

pub fn index_count_key(collection: &str, path: &str, mode_tag: &str) -> Vec<u8> {
    format!("n.{collection}.{path}.{mode_tag}").into_bytes()
}
