//! `$do … $join` resolution: replaces id-valued fields with the full
//! document fetched from another collection during projection.

use std::collections::HashMap;

use bson::{Bson, Document};
use chert_store::Transaction;

use crate::catalog::decode_document;
use crate::error::DbError;
use crate::ids::DocId;
use crate::keys;
use crate::planner::PK_FIELD;

/// Per-query join cache; dropped with the query.
pub(crate) struct JoinResolver {
    cache: HashMap<(String, DocId), Option<Document>>,
}

impl JoinResolver {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    /// Resolve the referenced document, consulting the cache first.
    /// Unresolvable references (bad id type, missing document, missing
    /// collection) yield `None` and leave the original value in place.
    pub fn resolve<T: Transaction>(
        &mut self,
        txn: &T,
        collection: &str,
        reference: &Bson,
    ) -> Result<Option<Document>, DbError> {
        for id in reference_ids(reference) {
            let cache_key = (collection.to_string(), id.clone());
            if let Some(hit) = self.cache.get(&cache_key) {
                if hit.is_some() {
                    return Ok(hit.clone());
                }
                continue;
            }
            let fetched = self.fetch(txn, collection, &id)?;
            self.cache.insert(cache_key, fetched.clone());
            if fetched.is_some() {
                return Ok(fetched);
            }
        }
        Ok(None)
    }

    fn fetch<T: Transaction>(
        &self,
        txn: &T,
        collection: &str,
        id: &DocId,
    ) -> Result<Option<Document>, DbError> {
        let ks = match txn.keyspace(collection) {
            Ok(ks) => ks,
            Err(chert_store::StoreError::KeyspaceNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match txn.get(&ks, &keys::record_key(id))? {
            Some(bytes) => {
                let mut doc = decode_document(&bytes)?;
                doc.insert(PK_FIELD, id.to_bson());
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }
}

/// An id reference is a typed scalar; a string that spells an ObjectId
/// is tried in both forms, oid first.
fn reference_ids(value: &Bson) -> Vec<DocId> {
    match value {
        Bson::String(s) => {
            let mut ids = Vec::with_capacity(2);
            if let Ok(oid) = bson::oid::ObjectId::parse_str(s) {
                ids.push(DocId::Oid(oid));
            }
            ids.push(DocId::Str(s.clone()));
            ids
        }
        other => DocId::from_bson(other).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_reference_tries_oid_form_first() {
        let hex = "507f1f77bcf86cd799439011";
        let ids = reference_ids(&Bson::String(hex.into()));
        assert_eq!(ids.len(), 2);
        assert!(matches!(ids[0], DocId::Oid(_)));
        assert!(matches!(ids[1], DocId::Str(_)));

        let ids = reference_ids(&Bson::String("plain".into()));
        assert_eq!(ids, vec![DocId::Str("plain".into())]);
    }

    #[test]
    fn non_scalar_reference_is_unresolvable() {
        assert!(reference_ids(&Bson::Boolean(true)).is_empty());
        assert!(reference_ids(&Bson::Document(Document::new())).is_empty());
    }
}
