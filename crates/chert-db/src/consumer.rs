//! The per-candidate consumer pipeline: load, residual-filter, mutate,
//! project, visit, count.

use bson::Document;
use chert_query::Path;
use chert_query::{MatchCtx, UpdateOp, apply_ops, matches};
use chert_store::Transaction;

use crate::catalog::decode_document;
use crate::error::DbError;
use crate::exec::{ExecEnv, store_document};
use crate::ids::DocId;
use crate::join::JoinResolver;
use crate::keys;
use crate::planner::PK_FIELD;
use crate::project;
use crate::scanner::{ScanConsumer, StepResult};
use crate::sorter::Sorter;

pub(crate) struct ExecState<'e, T: Transaction, F>
where
    F: FnMut(&DocId, Option<&Document>) -> i64,
{
    pub env: ExecEnv<'e, T>,
    visitor: &'e mut F,
    /// Count-only mode: skip projection and the visitor entirely.
    aggregate: bool,
    pub skip: u64,
    pub remaining: Option<u64>,
    pub count: u64,
    joins: JoinResolver,
}

impl<'e, T: Transaction, F> ExecState<'e, T, F>
where
    F: FnMut(&DocId, Option<&Document>) -> i64,
{
    pub fn new(env: ExecEnv<'e, T>, visitor: &'e mut F, aggregate: bool) -> Self {
        let skip = env.spec.skip;
        let remaining = env.spec.max;
        Self {
            env,
            visitor,
            aggregate,
            skip,
            remaining,
            count: 0,
            joins: JoinResolver::new(),
        }
    }

    /// Load and decode the document for a candidate id, injecting `_id`.
    ///
    /// `None` means the id has no document — an orphaned index entry,
    /// which is logged and skipped rather than failing the scan.
    fn load(&self, id: &DocId, doc_bytes: Option<&[u8]>) -> Result<Option<(Document, Vec<u8>)>, DbError> {
        let bytes = match doc_bytes {
            Some(b) => b.to_vec(),
            None => {
                let ks = self.env.txn.keyspace(self.env.collection)?;
                match self.env.txn.get(&ks, &keys::record_key(id))? {
                    Some(b) => b.into_owned(),
                    None => {
                        tracing::warn!(
                            collection = self.env.collection,
                            id = %id,
                            "orphaned index entry"
                        );
                        return Ok(None);
                    }
                }
            }
        };
        let mut doc = decode_document(&bytes)?;
        doc.insert(PK_FIELD, id.to_bson());
        Ok(Some((doc, bytes)))
    }

    fn residual_match(&self, doc: &Document) -> bool {
        match &self.env.spec.filter {
            Some(tree) => matches(tree, doc, &mut MatchCtx::default()),
            None => true,
        }
    }

    /// Steps 3–7 of the pipeline, shared by the direct path and the
    /// sorter drain. Returns the step to report upstream.
    pub fn process(&mut self, id: &DocId, mut doc: Document) -> Result<i64, DbError> {
        // $max == 0 yields nothing, even from a buffered sort drain.
        if self.remaining == Some(0) {
            return Ok(0);
        }
        let spec = self.env.spec;

        if spec.apply.dropall {
            store_document(
                self.env.txn,
                self.env.collection,
                self.env.indexes,
                id,
                Some(&doc),
                None,
            )?;
        } else if !spec.apply.ops.is_empty() {
            let mut updated = doc.clone();
            if apply_ops(&mut updated, &spec.apply.ops)? {
                store_document(
                    self.env.txn,
                    self.env.collection,
                    self.env.indexes,
                    id,
                    Some(&doc),
                    Some(&updated),
                )?;
            }
            doc = updated;
        } else if let Some(template) = spec.upsert_doc() {
            // A matched $upsert degrades to a field-wise $set.
            let ops: Vec<UpdateOp> = template
                .iter()
                .filter(|(k, _)| k.as_str() != PK_FIELD)
                .map(|(k, v)| UpdateOp::Set {
                    path: Path::parse(k),
                    value: v.clone(),
                })
                .collect();
            let mut updated = doc.clone();
            if apply_ops(&mut updated, &ops)? {
                store_document(
                    self.env.txn,
                    self.env.collection,
                    self.env.indexes,
                    id,
                    Some(&doc),
                    Some(&updated),
                )?;
            }
            doc = updated;
        }

        self.count += 1;

        let mut step = 1i64;
        if !self.aggregate {
            let has_projection =
                spec.fields.is_some() || !spec.joins.is_empty() || !spec.slices.is_empty();
            let projected = if has_projection {
                project::project(self.env.txn, spec, &mut self.joins, doc)?
            } else {
                doc
            };
            step = (self.visitor)(id, Some(&projected));
        }

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                step = 0;
            }
        }
        Ok(step)
    }

    /// Deliver the freshly upserted document to the visitor.
    pub fn visit_upserted(&mut self, id: &DocId, doc: &Document) {
        if !self.aggregate {
            (self.visitor)(id, Some(doc));
        }
    }
}

/// Streams matches straight through the pipeline, honouring `$skip` and
/// `$max` in scan order.
pub(crate) struct DirectConsumer<'e, T: Transaction, F>
where
    F: FnMut(&DocId, Option<&Document>) -> i64,
{
    pub state: ExecState<'e, T, F>,
}

impl<'e, T: Transaction, F> DirectConsumer<'e, T, F>
where
    F: FnMut(&DocId, Option<&Document>) -> i64,
{
    pub fn new(state: ExecState<'e, T, F>) -> Self {
        Self { state }
    }
}

impl<'e, T: Transaction, F> ScanConsumer for DirectConsumer<'e, T, F>
where
    F: FnMut(&DocId, Option<&Document>) -> i64,
{
    fn accept(&mut self, id: &DocId, doc_bytes: Option<&[u8]>) -> Result<StepResult, DbError> {
        // $max == 0 yields nothing at all.
        if self.state.remaining == Some(0) {
            return Ok(StepResult {
                step: 0,
                matched: false,
            });
        }
        let Some((doc, _)) = self.state.load(id, doc_bytes)? else {
            return Ok(StepResult {
                step: 1,
                matched: false,
            });
        };
        if !self.state.residual_match(&doc) {
            return Ok(StepResult {
                step: 1,
                matched: false,
            });
        }
        if self.state.skip > 0 {
            self.state.skip -= 1;
            return Ok(StepResult {
                step: 1,
                matched: true,
            });
        }
        let step = self.state.process(id, doc)?;
        Ok(StepResult {
            step,
            matched: true,
        })
    }

    fn finish(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Buffers matches into the sorter; the pipeline runs at drain time in
/// sort order, with `$skip` as the drain start offset.
pub(crate) struct SorterConsumer<'e, T: Transaction, F>
where
    F: FnMut(&DocId, Option<&Document>) -> i64,
{
    pub state: ExecState<'e, T, F>,
    sorter: Sorter,
}

impl<'e, T: Transaction, F> SorterConsumer<'e, T, F>
where
    F: FnMut(&DocId, Option<&Document>) -> i64,
{
    pub fn new(state: ExecState<'e, T, F>, sorter: Sorter) -> Self {
        Self { state, sorter }
    }
}

impl<'e, T: Transaction, F> ScanConsumer for SorterConsumer<'e, T, F>
where
    F: FnMut(&DocId, Option<&Document>) -> i64,
{
    fn accept(&mut self, id: &DocId, doc_bytes: Option<&[u8]>) -> Result<StepResult, DbError> {
        let Some((doc, bytes)) = self.state.load(id, doc_bytes)? else {
            return Ok(StepResult {
                step: 1,
                matched: false,
            });
        };
        if !self.state.residual_match(&doc) {
            return Ok(StepResult {
                step: 1,
                matched: false,
            });
        }
        self.sorter.add(id.clone(), &doc, &bytes)?;
        Ok(StepResult {
            step: 1,
            matched: true,
        })
    }

    fn finish(&mut self) -> Result<(), DbError> {
        let skip = self.state.skip;
        let state = &mut self.state;
        let sorter = &mut self.sorter;
        sorter.drain(skip, |id, mut doc| {
            doc.insert(PK_FIELD, id.to_bson());
            state.process(id, doc)
        })
    }
}
