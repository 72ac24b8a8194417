use bson::Document;
use chert_store::Transaction;
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::ids::DocId;
use crate::index::{IndexHandle, IndexMeta, SYS_KEYSPACE};
use crate::keys;

/// Persisted collection descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CollectionRecord {
    pub name: String,
}

/// Loads and persists collection/index descriptors and row counts in the
/// `_sys` keyspace.
pub(crate) struct Catalog;

impl Catalog {
    pub fn save_collection<T: Transaction>(txn: &T, name: &str) -> Result<(), DbError> {
        let sys = txn.keyspace(SYS_KEYSPACE)?;
        let record = CollectionRecord {
            name: name.to_string(),
        };
        let bytes = bson::serialize_to_vec(&record)?;
        txn.put(&sys, &keys::collection_meta_key(name), &bytes)?;
        Ok(())
    }

    pub fn remove_collection<T: Transaction>(txn: &T, name: &str) -> Result<(), DbError> {
        let sys = txn.keyspace(SYS_KEYSPACE)?;
        txn.delete(&sys, &keys::collection_meta_key(name))?;
        txn.delete(&sys, &keys::collection_count_key(name))?;
        let meta_keys: Vec<Vec<u8>> = txn
            .scan_prefix(&sys, &keys::index_meta_prefix(name))?
            .map(|r| r.map(|(k, _)| k.into_owned()))
            .collect::<Result<_, _>>()?;
        for key in meta_keys {
            txn.delete(&sys, &key)?;
        }
        Ok(())
    }

    pub fn list_collections<T: Transaction>(txn: &T) -> Result<Vec<String>, DbError> {
        let sys = txn.keyspace(SYS_KEYSPACE)?;
        let mut names = Vec::new();
        for item in txn.scan_prefix(&sys, &keys::collection_meta_prefix())? {
            let (_, value) = item?;
            let record: CollectionRecord = bson::deserialize_from_slice(&value)
                .map_err(|e| DbError::InvalidCollectionMeta(e.to_string()))?;
            names.push(record.name);
        }
        Ok(names)
    }

    pub fn save_index<T: Transaction>(
        txn: &T,
        collection: &str,
        meta: &IndexMeta,
    ) -> Result<(), DbError> {
        let sys = txn.keyspace(SYS_KEYSPACE)?;
        let key = keys::index_meta_key(collection, &meta.path, &meta.mode().meta_tag());
        let bytes = bson::serialize_to_vec(meta)?;
        txn.put(&sys, &key, &bytes)?;
        Ok(())
    }

    pub fn remove_index<T: Transaction>(
        txn: &T,
        collection: &str,
        meta: &IndexMeta,
    ) -> Result<(), DbError> {
        let sys = txn.keyspace(SYS_KEYSPACE)?;
        let tag = meta.mode().meta_tag();
        txn.delete(&sys, &keys::index_meta_key(collection, &meta.path, &tag))?;
        txn.delete(&sys, &keys::index_count_key(collection, &meta.path, &tag))?;
        Ok(())
    }

    /// Load every index descriptor of a collection with its row count.
    pub fn load_indexes<T: Transaction>(
        txn: &T,
        collection: &str,
    ) -> Result<Vec<IndexHandle>, DbError> {
        let sys = txn.keyspace(SYS_KEYSPACE)?;
        let mut handles = Vec::new();
        for item in txn.scan_prefix(&sys, &keys::index_meta_prefix(collection))? {
            let (_, value) = item?;
            let meta: IndexMeta = bson::deserialize_from_slice(&value)
                .map_err(|e| DbError::InvalidIndexMeta(e.to_string()))?;
            let count_key =
                keys::index_count_key(collection, &meta.path, &meta.mode().meta_tag());
            let rows = match txn.get(&sys, &count_key)? {
                Some(bytes) => {
                    let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                        DbError::InvalidIndexMeta(format!(
                            "bad row count for {collection}.{}",
                            meta.path
                        ))
                    })?;
                    u64::from_le_bytes(raw)
                }
                None => 0,
            };
            handles.push(IndexHandle::new(meta, rows));
        }
        Ok(handles)
    }

    pub fn record_count<T: Transaction>(txn: &T, collection: &str) -> Result<u64, DbError> {
        let sys = txn.keyspace(SYS_KEYSPACE)?;
        match txn.get(&sys, &keys::collection_count_key(collection))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                    DbError::InvalidCollectionMeta(format!("bad record count for {collection}"))
                })?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    pub fn bump_record_count<T: Transaction>(
        txn: &T,
        collection: &str,
        delta: i64,
    ) -> Result<(), DbError> {
        if delta == 0 {
            return Ok(());
        }
        let current = Self::record_count(txn, collection)?;
        let next = if delta > 0 {
            current + delta as u64
        } else {
            current.saturating_sub((-delta) as u64)
        };
        let sys = txn.keyspace(SYS_KEYSPACE)?;
        txn.put(
            &sys,
            &keys::collection_count_key(collection),
            &next.to_le_bytes(),
        )?;
        Ok(())
    }

    /// Recover the id sequence from the last numeric record key.
    pub fn recover_sequence<T: Transaction>(txn: &T, collection: &str) -> Result<i64, DbError> {
        let ks = txn.keyspace(collection)?;
        let mut iter = txn.scan_prefix_rev(&ks, &keys::record_i64_prefix())?;
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                match keys::parse_record_key(&key) {
                    Some(DocId::I64(n)) => Ok(n),
                    _ => Err(DbError::Corrupted(format!(
                        "unreadable record key in {collection}"
                    ))),
                }
            }
            None => Ok(0),
        }
    }
}

/// Deserialize stored document bytes.
pub(crate) fn decode_document(bytes: &[u8]) -> Result<Document, DbError> {
    Ok(bson::deserialize_from_slice(bytes)?)
}

/// Serialize a document for storage.
pub(crate) fn encode_document(doc: &Document) -> Result<Vec<u8>, DbError> {
    Ok(bson::serialize_to_vec(doc)?)
}
