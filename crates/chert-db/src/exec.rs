//! Shared execution plumbing: document writes with index upkeep, and the
//! caller-supplied explain log.

use std::fmt::Write as _;
use std::sync::Arc;

use bson::Document;
use chert_query::QuerySpec;
use chert_store::Transaction;

use crate::catalog::{Catalog, encode_document};
use crate::error::DbError;
use crate::ids::DocId;
use crate::index::{self, IndexHandle};
use crate::keys;
use crate::planner::{PK_FIELD, QueryPlan, ScanStrategy};

/// Everything a consumer needs to touch the collection.
pub(crate) struct ExecEnv<'e, T: Transaction> {
    pub txn: &'e T,
    pub collection: &'e str,
    pub indexes: &'e [Arc<IndexHandle>],
    pub spec: &'e QuerySpec,
}

/// Write one document transition (`old → new`, either side optional)
/// with all dependent index entries and row counts.
///
/// A unique-index collision aborts with `UniqueIndexViolation`; the
/// caller drops the transaction, rolling back the record write and every
/// index write in one step.
pub(crate) fn store_document<T: Transaction>(
    txn: &T,
    collection: &str,
    indexes: &[Arc<IndexHandle>],
    id: &DocId,
    old: Option<&Document>,
    new: Option<&Document>,
) -> Result<(), DbError> {
    let ks = txn.keyspace(collection)?;
    let record_key = keys::record_key(id);
    match new {
        Some(doc) => {
            // The id lives in the key, not the stored bytes.
            if doc.contains_key(PK_FIELD) {
                let mut stored = doc.clone();
                stored.remove(PK_FIELD);
                txn.put(&ks, &record_key, &encode_document(&stored)?)?;
            } else {
                txn.put(&ks, &record_key, &encode_document(doc)?)?;
            }
        }
        None => txn.delete(&ks, &record_key)?,
    }

    for idx in indexes {
        index::sync_document(txn, collection, idx, id, old, new)?;
    }

    let delta = match (old.is_some(), new.is_some()) {
        (false, true) => 1,
        (true, false) => -1,
        _ => 0,
    };
    Catalog::bump_record_count(txn, collection, delta)?;
    Ok(())
}

/// Caller-owned explain log. All writes are no-ops without a sink.
pub(crate) struct ExplainLog<'l> {
    sink: Option<&'l mut String>,
}

impl<'l> ExplainLog<'l> {
    pub fn new(sink: Option<&'l mut String>) -> Self {
        Self { sink }
    }

    pub fn line(&mut self, args: std::fmt::Arguments<'_>) {
        if let Some(sink) = self.sink.as_deref_mut() {
            let _ = sink.write_fmt(args);
            sink.push('\n');
        }
    }

    pub fn plan(&mut self, collection: &str, spec: &QuerySpec, plan: &QueryPlan<'_>) {
        if self.sink.is_none() {
            return;
        }
        self.line(format_args!("COLLECTION: '{collection}'"));
        let conditions = spec.filter.as_ref().map_or(0, |f| f.leaf_count());
        let ors = spec.filter.as_ref().map_or(0, |f| f.or_count());
        self.line(format_args!(
            "ACTIVE CONDITIONS: {conditions} $OR QUERIES: {ors}"
        ));
        match &plan.scan {
            ScanStrategy::PrimaryKey { ids } => {
                self.line(format_args!("PRIMARY KEY MATCHING: {} id(s)", ids.len()));
            }
            ScanStrategy::Index(p) => {
                self.line(format_args!(
                    "MAIN IDX: '{}' {} ROWS: {}",
                    p.idx.meta.path,
                    p.idx.meta.mode(),
                    p.idx.row_count()
                ));
                self.line(format_args!(
                    "CURSOR INIT: {} STEP: {}{}",
                    p.init.log_name(),
                    p.dir.log_name(),
                    if p.orderby_support { " ORDERBY" } else { "" }
                ));
            }
            ScanStrategy::Full { dir } => {
                self.line(format_args!("FULL SCAN STEP: {}", dir.log_name()));
            }
        }
        self.line(format_args!(
            "FINAL SORTING: {}",
            if plan.sorting { "YES" } else { "NO" }
        ));
    }

    pub fn results(&mut self, count: u64) {
        self.line(format_args!("RESULTS: {count}"));
    }
}
