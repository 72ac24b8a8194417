use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use bson::{Bson, Document};
use chert_query::{QueryParseError, QuerySpec, merge_patch, parse_query};
use chert_store::{Store, Transaction};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;

use crate::catalog::{Catalog, decode_document};
use crate::consumer::{DirectConsumer, ExecState, SorterConsumer};
use crate::error::DbError;
use crate::exec::{ExecEnv, ExplainLog, store_document};
use crate::ids::DocId;
use crate::index::{IndexHandle, IndexMeta, IndexMode, SYS_KEYSPACE};
use crate::keys;
use crate::planner::{self, PK_FIELD};
use crate::scanner::run_scan;
use crate::sorter::Sorter;

const BACKUP_MAGIC: &[u8; 8] = b"CHERTBK1";

/// Open-time options.
#[derive(Debug, Clone)]
pub struct DatabaseOpts {
    /// High-water mark of the in-memory sort region before the sorter
    /// spills to an anonymous temp file.
    pub sort_buffer_size: usize,
}

impl Default for DatabaseOpts {
    fn default() -> Self {
        Self {
            sort_buffer_size: 16 * 1024 * 1024,
        }
    }
}

/// One open collection: id sequence, declared indexes, and its lock.
struct CollectionShared {
    name: String,
    seq: AtomicI64,
    indexes: RwLock<Vec<Arc<IndexHandle>>>,
    lock: RwLock<()>,
}

impl CollectionShared {
    fn next_id(&self) -> i64 {
        self.seq.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }

    fn snapshot_indexes(&self) -> Vec<Arc<IndexHandle>> {
        self.indexes.read().clone()
    }
}

enum CollGuard<'a> {
    Read(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Write(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// An embeddable document database over an ordered key/value store.
///
/// Lock order is database registry before collection, released in
/// reverse. Queries carrying apply operators (or `$upsert`/`$dropall`)
/// take the collection lock in write mode, decided at parse time.
pub struct Database<S: Store> {
    store: S,
    opts: DatabaseOpts,
    collections: RwLock<HashMap<String, Arc<CollectionShared>>>,
}

impl<S: Store> Database<S> {
    /// Open a database over `store`, loading collection and index
    /// descriptors from the metadata keyspace.
    pub fn open(store: S, opts: DatabaseOpts) -> Result<Self, DbError> {
        store.create_keyspace(SYS_KEYSPACE)?;

        let names = {
            let txn = store.begin(true)?;
            Catalog::list_collections(&txn)?
        };
        for name in &names {
            store.create_keyspace(name)?;
        }

        let mut map = HashMap::new();
        {
            let txn = store.begin(true)?;
            for name in names {
                let indexes = Catalog::load_indexes(&txn, &name)?
                    .into_iter()
                    .map(Arc::new)
                    .collect();
                let seq = Catalog::recover_sequence(&txn, &name)?;
                map.insert(
                    name.clone(),
                    Arc::new(CollectionShared {
                        name,
                        seq: AtomicI64::new(seq),
                        indexes: RwLock::new(indexes),
                        lock: RwLock::new(()),
                    }),
                );
            }
        }

        Ok(Self {
            store,
            opts,
            collections: RwLock::new(map),
        })
    }

    /// Release the database. Buffers and locks unwind with the value.
    pub fn close(self) {}

    // ── Collection lifecycle ────────────────────────────────────

    /// Create the collection if it does not exist yet. Idempotent.
    pub fn collection_ensure(&self, name: &str) -> Result<(), DbError> {
        validate_collection_name(name)?;
        {
            let map = self.collections.read();
            if map.contains_key(name) {
                return Ok(());
            }
        }
        // Promote: the read guard above is gone before the write guard
        // is taken, and existence is re-checked under it.
        let mut map = self.collections.write();
        if map.contains_key(name) {
            return Ok(());
        }
        self.store.create_keyspace(name)?;
        let txn = self.store.begin(false)?;
        Catalog::save_collection(&txn, name)?;
        txn.commit()?;
        map.insert(
            name.to_string(),
            Arc::new(CollectionShared {
                name: name.to_string(),
                seq: AtomicI64::new(0),
                indexes: RwLock::new(Vec::new()),
                lock: RwLock::new(()),
            }),
        );
        Ok(())
    }

    pub fn collection_remove(&self, name: &str) -> Result<(), DbError> {
        let mut map = self.collections.write();
        if map.remove(name).is_none() {
            return Err(DbError::CollectionNotFound(name.to_string()));
        }
        let txn = self.store.begin(false)?;
        Catalog::remove_collection(&txn, name)?;
        txn.commit()?;
        self.store.drop_keyspace(name)?;
        Ok(())
    }

    pub fn collection_rename(&self, old: &str, new: &str) -> Result<(), DbError> {
        validate_collection_name(new)?;
        let mut map = self.collections.write();
        if map.contains_key(new) {
            return Err(DbError::TargetCollectionExists(new.to_string()));
        }
        let Some(shared) = map.remove(old) else {
            return Err(DbError::CollectionNotFound(old.to_string()));
        };

        let txn = self.store.begin(false)?;
        Catalog::remove_collection(&txn, old)?;
        Catalog::save_collection(&txn, new)?;
        for idx in shared.indexes.read().iter() {
            Catalog::save_index(&txn, new, &idx.meta)?;
            let sys = txn.keyspace(SYS_KEYSPACE)?;
            let tag = idx.meta.mode().meta_tag();
            txn.put(
                &sys,
                &keys::index_count_key(new, &idx.meta.path, &tag),
                &idx.row_count().to_le_bytes(),
            )?;
        }
        {
            let sys = txn.keyspace(SYS_KEYSPACE)?;
            let records = Catalog::record_count(&txn, old)?;
            txn.put(
                &sys,
                &keys::collection_count_key(new),
                &records.to_le_bytes(),
            )?;
        }
        txn.commit()?;
        self.store.rename_keyspace(old, new)?;

        map.insert(
            new.to_string(),
            Arc::new(CollectionShared {
                name: new.to_string(),
                seq: AtomicI64::new(shared.seq.load(AtomicOrdering::SeqCst)),
                indexes: RwLock::new(shared.snapshot_indexes()),
                lock: RwLock::new(()),
            }),
        );
        Ok(())
    }

    // ── Document operations ─────────────────────────────────────

    /// Store a document. The `_id` field, when present, supplies the id
    /// (replacing any existing document under it); otherwise a fresh id
    /// is drawn from the collection sequence.
    pub fn put(&self, collection: &str, doc: &Document) -> Result<DocId, DbError> {
        self.collection_ensure(collection)?;
        let map = self.collections.read();
        let shared = map
            .get(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let _guard = shared.lock.write();

        let id = match doc.get(PK_FIELD) {
            Some(v) => DocId::from_bson(v).ok_or_else(|| {
                DbError::InvalidDocumentId(format!("unsupported _id type: {v:?}"))
            })?,
            None => DocId::I64(shared.next_id()),
        };
        self.write_one(collection, &shared.snapshot_indexes(), &id, Some(doc))?;
        Ok(id)
    }

    /// Store a document under an explicit id.
    pub fn put_with_id(&self, collection: &str, id: &DocId, doc: &Document) -> Result<(), DbError> {
        self.collection_ensure(collection)?;
        let map = self.collections.read();
        let shared = map
            .get(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let _guard = shared.lock.write();
        self.write_one(collection, &shared.snapshot_indexes(), id, Some(doc))
    }

    pub fn get(&self, collection: &str, id: &DocId) -> Result<Option<Document>, DbError> {
        let map = self.collections.read();
        let Some(shared) = map.get(collection) else {
            return Ok(None);
        };
        let _guard = shared.lock.read();
        let txn = self.store.begin(true)?;
        let ks = txn.keyspace(collection)?;
        match txn.get(&ks, &keys::record_key(id))? {
            Some(bytes) => {
                let mut doc = decode_document(&bytes)?;
                doc.insert(PK_FIELD, id.to_bson());
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Remove a document. Returns whether it existed.
    pub fn del(&self, collection: &str, id: &DocId) -> Result<bool, DbError> {
        let map = self.collections.read();
        let shared = map
            .get(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let _guard = shared.lock.write();

        let txn = self.store.begin(false)?;
        let ks = txn.keyspace(collection)?;
        let Some(bytes) = txn.get(&ks, &keys::record_key(id))? else {
            return Ok(false);
        };
        let old = decode_document(&bytes)?;
        store_document(
            &txn,
            collection,
            &shared.snapshot_indexes(),
            id,
            Some(&old),
            None,
        )?;
        txn.commit()?;
        Ok(true)
    }

    /// RFC 7386 merge-patch of one document. With `upsert`, a missing
    /// document is created from the patch. Returns whether anything was
    /// written.
    pub fn patch(
        &self,
        collection: &str,
        id: &DocId,
        patch: &Bson,
        upsert: bool,
    ) -> Result<bool, DbError> {
        let Bson::Document(patch_doc) = patch else {
            return Err(DbError::PatchNotAnObject);
        };
        self.collection_ensure(collection)?;
        let map = self.collections.read();
        let shared = map
            .get(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let _guard = shared.lock.write();

        let txn = self.store.begin(false)?;
        let ks = txn.keyspace(collection)?;
        let indexes = shared.snapshot_indexes();
        match txn.get(&ks, &keys::record_key(id))? {
            Some(bytes) => {
                let old = decode_document(&bytes)?;
                let mut merged = old.clone();
                if !merge_patch(&mut merged, patch_doc) {
                    return Ok(false);
                }
                store_document(&txn, collection, &indexes, id, Some(&old), Some(&merged))?;
                txn.commit()?;
                Ok(true)
            }
            None if upsert => {
                store_document(&txn, collection, &indexes, id, None, Some(patch_doc))?;
                txn.commit()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Indexes ─────────────────────────────────────────────────

    /// Declare an index, back-filling entries for existing documents.
    /// Re-declaring the same path and type is a no-op; the same path and
    /// type with different uniqueness is refused.
    pub fn index_ensure(
        &self,
        collection: &str,
        path: &str,
        mode: IndexMode,
    ) -> Result<(), DbError> {
        if path.is_empty() {
            return Err(DbError::InvalidIndexMode("empty index path".into()));
        }
        self.collection_ensure(collection)?;
        let map = self.collections.read();
        let shared = map
            .get(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let _guard = shared.lock.write();

        for idx in shared.indexes.read().iter() {
            if idx.meta.path == path && idx.meta.kind == mode.kind {
                if idx.meta.unique != mode.unique {
                    return Err(DbError::MismatchedIndexUniqueness {
                        collection: collection.to_string(),
                        path: path.to_string(),
                    });
                }
                return Ok(());
            }
        }

        let handle = Arc::new(IndexHandle::new(
            IndexMeta {
                path: path.to_string(),
                kind: mode.kind,
                unique: mode.unique,
            },
            0,
        ));

        let txn = self.store.begin(false)?;
        Catalog::save_index(&txn, collection, &handle.meta)?;
        // Back-fill from existing documents.
        let records: Vec<(DocId, Vec<u8>)> = {
            let ks = txn.keyspace(collection)?;
            let mut out = Vec::new();
            for item in txn.scan_prefix(&ks, &keys::record_prefix())? {
                let (key, value) = item?;
                let id = keys::parse_record_key(&key).ok_or_else(|| {
                    DbError::Corrupted(format!("unreadable record key in {collection}"))
                })?;
                out.push((id, value.into_owned()));
            }
            out
        };
        for (id, bytes) in records {
            let doc = decode_document(&bytes)?;
            crate::index::sync_document(&txn, collection, &handle, &id, None, Some(&doc))?;
        }
        txn.commit()?;

        shared.indexes.write().push(handle);
        Ok(())
    }

    /// Drop an index and all of its entries.
    pub fn index_remove(
        &self,
        collection: &str,
        path: &str,
        mode: IndexMode,
    ) -> Result<(), DbError> {
        let map = self.collections.read();
        let shared = map
            .get(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let _guard = shared.lock.write();

        let mut indexes = shared.indexes.write();
        let Some(pos) = indexes
            .iter()
            .position(|i| i.meta.path == path && i.meta.kind == mode.kind)
        else {
            return Ok(());
        };
        let handle = indexes[pos].clone();

        let txn = self.store.begin(false)?;
        Catalog::remove_index(&txn, collection, &handle.meta)?;
        let entry_keys: Vec<Vec<u8>> = {
            let ks = txn.keyspace(collection)?;
            txn.scan_prefix(&ks, &handle.key_prefix())?
                .map(|r| r.map(|(k, _)| k.into_owned()))
                .collect::<Result<_, _>>()?
        };
        let ks = txn.keyspace(collection)?;
        for key in entry_keys {
            txn.delete(&ks, &key)?;
        }
        txn.commit()?;

        indexes.remove(pos);
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Execute a query, streaming results to `visitor`. Returns the
    /// number of processed documents.
    pub fn query_exec<F>(
        &self,
        collection: &str,
        query: &Document,
        hints: Option<&Document>,
        mut visitor: F,
        log: Option<&mut String>,
    ) -> Result<u64, DbError>
    where
        F: FnMut(&DocId, Option<&Document>) -> i64,
    {
        let spec = self.parse(query, hints)?;
        self.execute(collection, &spec, &mut visitor, false, log)
    }

    /// Count documents matching a query, up to `limit`.
    pub fn query_count(
        &self,
        collection: &str,
        query: &Document,
        hints: Option<&Document>,
        limit: Option<u64>,
    ) -> Result<u64, DbError> {
        let mut spec = self.parse(query, hints)?;
        cap_max(&mut spec, limit);
        self.execute(
            collection,
            &spec,
            &mut |_: &DocId, _: Option<&Document>| 1,
            true,
            None,
        )
    }

    /// Materialise matching documents, up to `limit`.
    pub fn query_list(
        &self,
        collection: &str,
        query: &Document,
        hints: Option<&Document>,
        limit: Option<u64>,
    ) -> Result<Vec<(DocId, Document)>, DbError> {
        let mut spec = self.parse(query, hints)?;
        cap_max(&mut spec, limit);
        let mut out = Vec::new();
        self.execute(
            collection,
            &spec,
            &mut |id: &DocId, doc: Option<&Document>| {
                if let Some(doc) = doc {
                    out.push((id.clone(), doc.clone()));
                }
                1
            },
            false,
            None,
        )?;
        Ok(out)
    }

    fn parse(&self, query: &Document, hints: Option<&Document>) -> Result<QuerySpec, DbError> {
        let raw = bson::RawDocumentBuf::try_from(query)?;
        let mut spec = parse_query(&raw)?;
        if let Some(hints) = hints {
            apply_hints(&mut spec, hints)?;
        }
        Ok(spec)
    }

    fn execute<F>(
        &self,
        collection: &str,
        spec: &QuerySpec,
        visitor: &mut F,
        aggregate: bool,
        log: Option<&mut String>,
    ) -> Result<u64, DbError>
    where
        F: FnMut(&DocId, Option<&Document>) -> i64,
    {
        let mutation = spec.has_mutation();
        if mutation {
            // $upsert and friends create the collection on demand.
            self.collection_ensure(collection)?;
        }

        let map = self.collections.read();
        let Some(shared) = map.get(collection) else {
            let mut log = ExplainLog::new(log);
            log.line(format_args!("COLLECTION: '{collection}' (empty)"));
            log.results(0);
            return Ok(0);
        };
        let _guard = if mutation {
            CollGuard::Write(shared.lock.write())
        } else {
            CollGuard::Read(shared.lock.read())
        };

        let indexes = shared.snapshot_indexes();
        let plan = planner::plan(spec, &indexes);
        let mut log = ExplainLog::new(log);
        log.plan(collection, spec, &plan);

        let txn = self.store.begin(!mutation)?;
        let count = {
            let env = ExecEnv {
                txn: &txn,
                collection,
                indexes: &indexes,
                spec,
            };
            let state = ExecState::new(env, visitor, aggregate);
            let mut state = if plan.sorting {
                let sorter = Sorter::new(&spec.order, self.opts.sort_buffer_size);
                let mut consumer = SorterConsumer::new(state, sorter);
                run_scan(&txn, collection, &plan, &mut consumer)?;
                consumer.state
            } else {
                let mut consumer = DirectConsumer::new(state);
                run_scan(&txn, collection, &plan, &mut consumer)?;
                consumer.state
            };
            if state.count == 0 && spec.upsert_doc().is_some() {
                upsert_insert(&mut state, || shared.next_id())?;
            }
            state.count
        };
        if mutation {
            txn.commit()?;
        } else {
            txn.rollback()?;
        }

        log.results(count);
        Ok(count)
    }

    fn write_one(
        &self,
        collection: &str,
        indexes: &[Arc<IndexHandle>],
        id: &DocId,
        doc: Option<&Document>,
    ) -> Result<(), DbError> {
        let txn = self.store.begin(false)?;
        let ks = txn.keyspace(collection)?;
        let old = match txn.get(&ks, &keys::record_key(id))? {
            Some(bytes) => Some(decode_document(&bytes)?),
            None => None,
        };
        store_document(&txn, collection, indexes, id, old.as_ref(), doc)?;
        txn.commit()?;
        Ok(())
    }

    // ── Introspection & backup ──────────────────────────────────

    /// Report collections, indexes and record counts.
    pub fn meta(&self) -> Result<DatabaseMeta, DbError> {
        let map = self.collections.read();
        let txn = self.store.begin(true)?;
        let mut collections = Vec::new();
        let mut names: Vec<&String> = map.keys().collect();
        names.sort();
        for name in names {
            let shared = &map[name];
            let _guard = shared.lock.read();
            let records = Catalog::record_count(&txn, name)?;
            let indexes = shared
                .indexes
                .read()
                .iter()
                .map(|i| IndexInfo {
                    path: i.meta.path.clone(),
                    mode: i.meta.mode().to_string(),
                    rows: i.row_count(),
                })
                .collect();
            collections.push(CollectionMeta {
                name: shared.name.clone(),
                records,
                indexes,
            });
        }
        Ok(DatabaseMeta { collections })
    }

    /// Write a consistent snapshot of every keyspace to `target`.
    /// Returns the backup timestamp in epoch milliseconds.
    pub fn online_backup(&self, target: &std::path::Path) -> Result<u64, DbError> {
        // Holding the registry read lock keeps DDL out; the snapshot
        // transaction keeps writers invisible.
        let _map = self.collections.read();
        let txn = self.store.begin(true)?;

        let file = std::fs::File::create(target)?;
        let mut out = std::io::BufWriter::new(file);
        out.write_all(BACKUP_MAGIC)?;
        for name in self.store.list_keyspaces()? {
            let ks = txn.keyspace(&name)?;
            let entries: Vec<(Vec<u8>, Vec<u8>)> = txn
                .scan_prefix(&ks, b"")?
                .map(|r| r.map(|(k, v)| (k.into_owned(), v.into_owned())))
                .collect::<Result<_, _>>()?;
            out.write_all(&(name.len() as u32).to_le_bytes())?;
            out.write_all(name.as_bytes())?;
            out.write_all(&(entries.len() as u64).to_le_bytes())?;
            for (k, v) in entries {
                out.write_all(&(k.len() as u32).to_le_bytes())?;
                out.write_all(&k)?;
                out.write_all(&(v.len() as u32).to_le_bytes())?;
                out.write_all(&v)?;
            }
        }
        out.flush()?;

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(ts)
    }
}

/// Insert the `$upsert` template when the query matched nothing.
fn upsert_insert<T, F>(
    state: &mut ExecState<'_, T, F>,
    fresh_id: impl FnOnce() -> i64,
) -> Result<(), DbError>
where
    T: Transaction,
    F: FnMut(&DocId, Option<&Document>) -> i64,
{
    let Some(template) = state.env.spec.upsert_doc() else {
        return Ok(());
    };
    let id = match template.get(PK_FIELD) {
        Some(v) => DocId::from_bson(v).ok_or_else(|| {
            DbError::InvalidDocumentId(format!("unsupported _id type: {v:?}"))
        })?,
        None => DocId::I64(fresh_id()),
    };
    store_document(
        state.env.txn,
        state.env.collection,
        state.env.indexes,
        &id,
        None,
        Some(template),
    )?;
    state.count = 1;
    let mut doc = template.clone();
    doc.remove(PK_FIELD);
    doc.insert(PK_FIELD, id.to_bson());
    state.visit_upserted(&id, &doc);
    Ok(())
}

fn cap_max(spec: &mut QuerySpec, limit: Option<u64>) {
    if let Some(limit) = limit {
        spec.max = Some(spec.max.map_or(limit, |m| m.min(limit)));
    }
}

/// Merge a hints document into the spec: `$orderby`, `$skip`, `$max`,
/// `$fields` and `$do` override or extend what the query carried.
fn apply_hints(spec: &mut QuerySpec, hints: &Document) -> Result<(), DbError> {
    let raw = bson::RawDocumentBuf::try_from(hints)?;
    let parsed = parse_query(&raw)?;
    if parsed.filter.is_some() || parsed.has_mutation() {
        return Err(DbError::QueryParse(QueryParseError {
            message: "hints may only contain $orderby, $skip, $max, $fields, $do".into(),
            offset: None,
        }));
    }
    if hints.contains_key("$orderby") {
        spec.order = parsed.order;
    }
    if hints.contains_key("$skip") {
        spec.skip = parsed.skip;
    }
    if hints.contains_key("$max") {
        spec.max = parsed.max;
    }
    if hints.contains_key("$fields") {
        spec.fields = parsed.fields;
    }
    if hints.contains_key("$do") {
        spec.joins.extend(parsed.joins);
        spec.slices.extend(parsed.slices);
    }
    Ok(())
}

fn validate_collection_name(name: &str) -> Result<(), DbError> {
    let ok = !name.is_empty()
        && !name.starts_with('_')
        && !name.contains(['.', '\0'])
        && name.len() <= 255;
    if ok {
        Ok(())
    } else {
        Err(DbError::InvalidCollectionName(name.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseMeta {
    pub collections: Vec<CollectionMeta>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionMeta {
    pub name: String,
    pub records: u64,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub path: String,
    pub mode: String,
    pub rows: u64,
}
