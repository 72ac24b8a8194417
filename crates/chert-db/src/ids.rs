use std::cmp::Ordering;

use bson::Bson;
use bson::oid::ObjectId;

use crate::error::DbError;

const TAG_STR: u8 = 0x02;
const TAG_OID: u8 = 0x07;
const TAG_I64: u8 = 0x12;

/// A typed document id.
///
/// Callers may supply a string or ObjectId through the `_id` field;
/// auto-assigned ids come from the collection's monotonic i64 sequence.
/// The byte encoding orders ids of one type correctly under plain byte
/// comparison, which is what keeps the primary map in id order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocId {
    I64(i64),
    Str(String),
    Oid(ObjectId),
}

impl DocId {
    fn tag(&self) -> u8 {
        match self {
            DocId::Str(_) => TAG_STR,
            DocId::Oid(_) => TAG_OID,
            DocId::I64(_) => TAG_I64,
        }
    }

    /// Extract an id from a BSON value (the `_id` field or a query rhs).
    pub fn from_bson(v: &Bson) -> Option<DocId> {
        match v {
            Bson::Int32(n) => Some(DocId::I64(*n as i64)),
            Bson::Int64(n) => Some(DocId::I64(*n)),
            Bson::String(s) => Some(DocId::Str(s.clone())),
            Bson::ObjectId(oid) => Some(DocId::Oid(*oid)),
            _ => None,
        }
    }

    pub fn to_bson(&self) -> Bson {
        match self {
            DocId::I64(n) => Bson::Int64(*n),
            DocId::Str(s) => Bson::String(s.clone()),
            DocId::Oid(oid) => Bson::ObjectId(*oid),
        }
    }

    /// `[tag][payload]` — i64 payload is sign-flipped big-endian so that
    /// numeric ids order correctly bytewise.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(13);
        buf.push(self.tag());
        match self {
            DocId::I64(n) => {
                buf.extend_from_slice(&((*n as u64) ^ (1u64 << 63)).to_be_bytes());
            }
            DocId::Str(s) => buf.extend_from_slice(s.as_bytes()),
            DocId::Oid(oid) => buf.extend_from_slice(&oid.bytes()),
        }
        buf
    }

    /// Decode a `[tag][payload]` block that spans the whole slice.
    pub fn decode(bytes: &[u8]) -> Result<DocId, DbError> {
        let (tag, payload) = bytes
            .split_first()
            .ok_or_else(|| DbError::Corrupted("empty document id".into()))?;
        match *tag {
            TAG_I64 => {
                let raw: [u8; 8] = payload
                    .try_into()
                    .map_err(|_| DbError::Corrupted("truncated i64 id".into()))?;
                Ok(DocId::I64((u64::from_be_bytes(raw) ^ (1u64 << 63)) as i64))
            }
            TAG_STR => {
                let s = std::str::from_utf8(payload)
                    .map_err(|_| DbError::Corrupted("non-utf8 string id".into()))?;
                Ok(DocId::Str(s.to_string()))
            }
            TAG_OID => {
                let raw: [u8; 12] = payload
                    .try_into()
                    .map_err(|_| DbError::Corrupted("truncated object id".into()))?;
                Ok(DocId::Oid(ObjectId::from_bytes(raw)))
            }
            other => Err(DbError::Corrupted(format!("unknown id tag: {other:#x}"))),
        }
    }

    /// Append this id as a trailing block: `[payload][tag][len: 2 BE]`.
    ///
    /// Keys that carry arbitrary value bytes before the id (duplicate
    /// index entries) use this form — the fixed-size suffix makes the id
    /// recoverable from the end without scanning the value.
    pub fn append_tail(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        match self {
            DocId::I64(n) => {
                buf.extend_from_slice(&((*n as u64) ^ (1u64 << 63)).to_be_bytes());
            }
            DocId::Str(s) => buf.extend_from_slice(s.as_bytes()),
            DocId::Oid(oid) => buf.extend_from_slice(&oid.bytes()),
        }
        let len = (buf.len() - start) as u16;
        buf.push(self.tag());
        buf.extend_from_slice(&len.to_be_bytes());
    }

    /// Split a trailing id block off a key, returning the leading bytes
    /// (the encoded value) and the id.
    pub fn split_tail(bytes: &[u8]) -> Result<(&[u8], DocId), DbError> {
        if bytes.len() < 3 {
            return Err(DbError::Corrupted("truncated index entry".into()));
        }
        let len_pos = bytes.len() - 2;
        let len = u16::from_be_bytes([bytes[len_pos], bytes[len_pos + 1]]) as usize;
        let tag_pos = len_pos - 1;
        let payload_start = tag_pos
            .checked_sub(len)
            .ok_or_else(|| DbError::Corrupted("bad index entry id length".into()))?;
        let mut block = Vec::with_capacity(1 + len);
        block.push(bytes[tag_pos]);
        block.extend_from_slice(&bytes[payload_start..tag_pos]);
        let id = DocId::decode(&block)?;
        Ok((&bytes[..payload_start], id))
    }
}

impl PartialOrd for DocId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (DocId::I64(a), DocId::I64(b)) => a.cmp(b),
            (DocId::Str(a), DocId::Str(b)) => a.cmp(b),
            (DocId::Oid(a), DocId::Oid(b)) => a.bytes().cmp(&b.bytes()),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocId::I64(n) => write!(f, "{n}"),
            DocId::Str(s) => write!(f, "{s}"),
            DocId::Oid(oid) => write!(f, "{oid}"),
        }
    }
}
