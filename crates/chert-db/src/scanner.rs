//! Index and collection scanners.
//!
//! Every scanner streams candidate document ids to a [`ScanConsumer`].
//! The consumer answers with a step: positive advances that many
//! entries, negative rewinds, zero stops the scan. A successful scan
//! ends with one `finish` call; error paths skip it and let the caller
//! unwind.

use bson::Bson;
use chert_query::FilterOp;
use chert_store::{ScanIter, Transaction};

use crate::error::DbError;
use crate::ids::DocId;
use crate::index::IndexHandle;
use crate::keys;
use crate::planner::{
    CursorDir, CursorInit, IndexScanPlan, QueryPlan, ScanStrategy, leaf_lower_bound,
    leaf_upper_bound,
};

pub(crate) struct StepResult {
    pub step: i64,
    pub matched: bool,
}

pub(crate) trait ScanConsumer {
    /// One candidate id. `doc_bytes` is set when the scanner's cursor
    /// already points at the document (full scans).
    fn accept(&mut self, id: &DocId, doc_bytes: Option<&[u8]>) -> Result<StepResult, DbError>;

    /// End of stream on the success path.
    fn finish(&mut self) -> Result<(), DbError>;
}

/// Run the plan's scanner and finish the consumer.
pub(crate) fn run_scan<T: Transaction, C: ScanConsumer>(
    txn: &T,
    collection: &str,
    plan: &QueryPlan<'_>,
    consumer: &mut C,
) -> Result<(), DbError> {
    match &plan.scan {
        ScanStrategy::PrimaryKey { ids } => scan_primary(ids, consumer)?,
        ScanStrategy::Full { dir } => scan_full(txn, collection, *dir, consumer)?,
        ScanStrategy::Index(p) if p.idx.meta.unique => scan_unique(txn, collection, p, consumer)?,
        ScanStrategy::Index(p) => scan_dup(txn, collection, p, consumer)?,
    }
    consumer.finish()
}

// ── Step-aware iteration ────────────────────────────────────────

/// Pull-based cursor with rewind support.
///
/// Keys are retained so negative steps can revisit earlier entries;
/// values are retained only for index scans (they carry the id), while
/// full scans re-fetch rewound documents by id instead of buffering
/// every document the cursor passed.
struct StepIter<'c> {
    src: ScanIter<'c>,
    keep_values: bool,
    keys: Vec<Vec<u8>>,
    values: Vec<Option<Vec<u8>>>,
    /// Index of the current entry; -1 before the first advance.
    pos: isize,
}

impl<'c> StepIter<'c> {
    fn new(src: ScanIter<'c>, keep_values: bool) -> Self {
        Self {
            src,
            keep_values,
            keys: Vec::new(),
            values: Vec::new(),
            pos: -1,
        }
    }

    /// Move by `step` entries. Returns the entry at the new position, or
    /// `None` past either end of the stream. The value is `Some` only
    /// for freshly pulled entries or when `keep_values` is set.
    fn advance(&mut self, step: i64) -> Result<Option<(&[u8], Option<&[u8]>)>, DbError> {
        let target = self.pos.saturating_add(step as isize);
        if target < 0 {
            return Ok(None);
        }
        while (self.keys.len() as isize) <= target {
            match self.src.next() {
                Some(Ok((k, v))) => {
                    self.keys.push(k.into_owned());
                    if self.keep_values {
                        self.values.push(Some(v.into_owned()));
                    } else {
                        // Keep only the newest value live.
                        if let Some(last) = self.values.last_mut() {
                            *last = None;
                        }
                        self.values.push(Some(v.into_owned()));
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
        self.pos = target;
        let idx = target as usize;
        Ok(Some((
            self.keys[idx].as_slice(),
            self.values[idx].as_deref(),
        )))
    }
}

// ── Primary-key scanner ─────────────────────────────────────────

/// Point visits over an `$eq`/`$in` id set, honouring the step protocol.
fn scan_primary<C: ScanConsumer>(ids: &[DocId], consumer: &mut C) -> Result<(), DbError> {
    let mut pos: i64 = 0;
    while pos >= 0 && (pos as usize) < ids.len() {
        let res = consumer.accept(&ids[pos as usize], None)?;
        if res.step == 0 {
            break;
        }
        pos += res.step;
    }
    Ok(())
}

// ── Full collection scanner ─────────────────────────────────────

fn scan_full<T: Transaction, C: ScanConsumer>(
    txn: &T,
    collection: &str,
    dir: CursorDir,
    consumer: &mut C,
) -> Result<(), DbError> {
    let ks = txn.keyspace(collection)?;
    let prefix = keys::record_prefix();
    let iter = match dir {
        CursorDir::Fwd => txn.scan_prefix(&ks, &prefix)?,
        CursorDir::Rev => txn.scan_prefix_rev(&ks, &prefix)?,
    };
    let mut entries = StepIter::new(iter, false);
    let mut step = 1i64;
    loop {
        let Some((key, value)) = entries.advance(step)? else {
            break;
        };
        let id = keys::parse_record_key(key)
            .ok_or_else(|| DbError::Corrupted(format!("unreadable record key in {collection}")))?;
        let res = consumer.accept(&id, value)?;
        step = res.step;
        if step == 0 {
            break;
        }
    }
    Ok(())
}

// ── Bounded index window ────────────────────────────────────────

enum Seek {
    FullFwd,
    FullRev,
    /// Ascending from the first value `>=` these bytes.
    FromLower(Vec<u8>),
    /// Descending from the last value `<=` these bytes.
    FromUpper(Vec<u8>),
}

struct Terminal {
    bytes: Vec<u8>,
    inclusive: bool,
}

/// The byte-level shape of one bounded scan over an index region.
struct Window {
    seek: Seek,
    rev: bool,
    /// Strict bounds: entries with exactly these value bytes are skipped.
    skip_equal: Option<Vec<u8>>,
    /// Reverse scans over duplicate keyspaces fast-forward past values
    /// above the upper bound instead of seeking (id tails make a precise
    /// seek key ambiguous).
    skip_above: Option<Vec<u8>>,
    /// `$begin`: stop at the first value without the prefix.
    prefix_guard: Option<Vec<u8>>,
    /// Fail-fast bound from expr2 (or the driving upper bound).
    terminal: Option<Terminal>,
}

impl Window {
    /// True when the entry at `value` lies past the fail-fast bound.
    fn past_terminal(&self, value: &[u8]) -> bool {
        let Some(term) = &self.terminal else {
            return false;
        };
        let bound = term.bytes.as_slice();
        if self.rev {
            if term.inclusive { value < bound } else { value <= bound }
        } else if term.inclusive {
            value > bound
        } else {
            value >= bound
        }
    }

    fn skip(&self, value: &[u8]) -> bool {
        if self.skip_equal.as_deref() == Some(value) {
            return true;
        }
        matches!(&self.skip_above, Some(above) if value > above.as_slice())
    }
}

fn coerce_bound(idx: &IndexHandle, v: &Bson) -> Option<Vec<u8>> {
    idx.coerce(v)
}

/// Translate the plan's bounding expressions into byte-level guards.
///
/// `None` means the driving bound cannot be represented in the index's
/// value type at all, which makes the scan empty (the filter compares a
/// value no entry of this type can satisfy).
fn build_window(plan: &IndexScanPlan<'_>, dup: bool) -> Option<Window> {
    let mut window = Window {
        seek: if plan.dir == CursorDir::Fwd {
            Seek::FullFwd
        } else {
            Seek::FullRev
        },
        rev: plan.dir == CursorDir::Rev,
        skip_equal: None,
        skip_above: None,
        prefix_guard: None,
        terminal: None,
    };
    let Some(expr1) = plan.expr1 else {
        return Some(window);
    };

    match (&expr1.op, plan.dir) {
        (FilterOp::Prefix(prefixes), _) => {
            let p = prefixes.first()?.as_bytes().to_vec();
            window.seek = Seek::FromLower(p.clone());
            window.prefix_guard = Some(p);
        }
        (FilterOp::Gt(_) | FilterOp::Gte(_) | FilterOp::Between(..), CursorDir::Fwd) => {
            let lo = leaf_lower_bound(expr1).expect("lower-bound op");
            let lob = coerce_bound(&plan.idx, lo)?;
            if matches!(expr1.op, FilterOp::Gt(_)) {
                window.skip_equal = Some(lob.clone());
            }
            window.seek = Seek::FromLower(lob);
            window.terminal = upper_terminal(&plan.idx, plan.expr2);
        }
        (FilterOp::Lt(_) | FilterOp::Lte(_), CursorDir::Fwd) => {
            let hi = leaf_upper_bound(expr1).expect("upper-bound op");
            let hib = coerce_bound(&plan.idx, hi)?;
            window.terminal = Some(Terminal {
                bytes: hib,
                inclusive: matches!(expr1.op, FilterOp::Lte(_)),
            });
        }
        (FilterOp::Lt(_) | FilterOp::Lte(_) | FilterOp::Between(..), CursorDir::Rev) => {
            let hi = leaf_upper_bound(expr1).expect("upper-bound op");
            let hib = coerce_bound(&plan.idx, hi)?;
            if matches!(expr1.op, FilterOp::Lt(_)) {
                window.skip_equal = Some(hib.clone());
            }
            if dup {
                window.skip_above = Some(hib);
            } else {
                window.seek = Seek::FromUpper(hib);
            }
            window.terminal = lower_terminal(&plan.idx, plan.expr2);
        }
        (FilterOp::Gt(_) | FilterOp::Gte(_), CursorDir::Rev) => {
            // Reverse walk bounded only from below: start at the end.
            window.terminal = Some(Terminal {
                bytes: coerce_bound(&plan.idx, leaf_lower_bound(expr1)?)?,
                inclusive: matches!(expr1.op, FilterOp::Gte(_)),
            });
        }
        _ => return Some(window),
    }
    Some(window)
}

fn upper_terminal(idx: &IndexHandle, expr2: Option<&chert_query::FilterLeaf>) -> Option<Terminal> {
    let leaf = expr2?;
    let hi = leaf_upper_bound(leaf)?;
    let bytes = idx.coerce(hi)?;
    Some(Terminal {
        bytes,
        inclusive: !matches!(leaf.op, FilterOp::Lt(_)),
    })
}

fn lower_terminal(idx: &IndexHandle, expr2: Option<&chert_query::FilterLeaf>) -> Option<Terminal> {
    let leaf = expr2?;
    let lo = leaf_lower_bound(leaf)?;
    let bytes = idx.coerce(lo)?;
    Some(Terminal {
        bytes,
        inclusive: !matches!(leaf.op, FilterOp::Gt(_)),
    })
}

/// Sorted, coerced, deduplicated `$in` members for point passes.
fn sorted_in_values(idx: &IndexHandle, values: &[Bson]) -> Vec<Vec<u8>> {
    let mut out: Vec<Vec<u8>> = values.iter().filter_map(|v| idx.coerce(v)).collect();
    out.sort();
    out.dedup();
    out
}

/// Mark the driving expression as guaranteed for the rest of the scan.
/// Prefix bounds stay residual — the guard checks raw bytes only.
fn prematch_driving(plan: &IndexScanPlan<'_>, matched: bool) {
    if !matched {
        return;
    }
    if let Some(expr1) = plan.expr1 {
        if !matches!(expr1.op, FilterOp::Prefix(_)) {
            expr1.prematched.set(true);
        }
    }
}

// ── Unique-index scanner ────────────────────────────────────────

fn scan_unique<T: Transaction, C: ScanConsumer>(
    txn: &T,
    collection: &str,
    plan: &IndexScanPlan<'_>,
    consumer: &mut C,
) -> Result<(), DbError> {
    let ks = txn.keyspace(collection)?;
    let prefix = plan.idx.key_prefix();

    if plan.init == CursorInit::Eq {
        let expr1 = plan.expr1.expect("eq scan has a driving expression");
        match &expr1.op {
            FilterOp::Eq(v) => {
                let Some(vb) = plan.idx.coerce(v) else {
                    return Ok(());
                };
                if let Some(stored) = txn.get(&ks, &keys::unique_key(&prefix, &vb))? {
                    let id = DocId::decode(&stored)?;
                    consumer.accept(&id, None)?;
                }
                return Ok(());
            }
            FilterOp::In(vs) => {
                let vals = sorted_in_values(&plan.idx, vs);
                let mut pos: i64 = 0;
                while pos >= 0 && (pos as usize) < vals.len() {
                    let key = keys::unique_key(&prefix, &vals[pos as usize]);
                    match txn.get(&ks, &key)? {
                        Some(stored) => {
                            let id = DocId::decode(&stored)?;
                            let res = consumer.accept(&id, None)?;
                            if res.step == 0 {
                                break;
                            }
                            pos += res.step;
                        }
                        None => pos += 1,
                    }
                }
                return Ok(());
            }
            other => {
                return Err(DbError::Corrupted(format!(
                    "eq cursor with non-point operator: {other:?}"
                )));
            }
        }
    }

    let Some(window) = build_window(plan, false) else {
        return Ok(());
    };
    let iter = match &window.seek {
        Seek::FullFwd => txn.scan_prefix(&ks, &prefix)?,
        Seek::FullRev => txn.scan_prefix_rev(&ks, &prefix)?,
        Seek::FromLower(v) => txn.scan_from(&ks, &prefix, &keys::unique_key(&prefix, v))?,
        Seek::FromUpper(v) => txn.scan_from_rev(&ks, &prefix, &keys::unique_key(&prefix, v))?,
    };
    let mut entries = StepIter::new(iter, true);
    let mut step = 1i64;
    loop {
        let Some((key, value)) = entries.advance(step)? else {
            break;
        };
        let Some(vbytes) = keys::parse_unique_key(key, &prefix) else {
            break;
        };
        if window.skip(vbytes) {
            step = 1;
            continue;
        }
        if let Some(guard) = &window.prefix_guard {
            if !vbytes.starts_with(guard) {
                break;
            }
        }
        if window.past_terminal(vbytes) {
            break;
        }
        let stored = value.ok_or_else(|| {
            DbError::Corrupted(format!("unique index entry without id in {collection}"))
        })?;
        let id = DocId::decode(stored)?;
        let res = consumer.accept(&id, None)?;
        prematch_driving(plan, res.matched);
        step = res.step;
        if step == 0 {
            break;
        }
    }
    Ok(())
}

// ── Duplicate-index scanner ─────────────────────────────────────

fn scan_dup<T: Transaction, C: ScanConsumer>(
    txn: &T,
    collection: &str,
    plan: &IndexScanPlan<'_>,
    consumer: &mut C,
) -> Result<(), DbError> {
    let ks = txn.keyspace(collection)?;
    let prefix = plan.idx.key_prefix();
    let kind = plan.idx.meta.kind;

    if plan.init == CursorInit::Eq {
        let expr1 = plan.expr1.expect("eq scan has a driving expression");
        let point_values = match &expr1.op {
            FilterOp::Eq(v) => plan.idx.coerce(v).map(|vb| vec![vb]).unwrap_or_default(),
            FilterOp::In(vs) => sorted_in_values(&plan.idx, vs),
            other => {
                return Err(DbError::Corrupted(format!(
                    "eq cursor with non-point operator: {other:?}"
                )));
            }
        };
        let mut prev_id: Option<DocId> = None;
        'values: for vb in &point_values {
            let value_prefix = keys::dup_value_prefix(&prefix, kind, vb);
            let iter = txn.scan_prefix(&ks, &value_prefix)?;
            let mut entries = StepIter::new(iter, false);
            let mut step = 1i64;
            loop {
                let Some((key, _)) = entries.advance(step)? else {
                    break;
                };
                let Some((_, id)) = keys::parse_dup_key(key, &prefix, kind) else {
                    return Err(DbError::Corrupted(format!(
                        "unreadable index entry in {collection}"
                    )));
                };
                if prev_id.as_ref() == Some(&id) {
                    step = 1;
                    continue;
                }
                let res = consumer.accept(&id, None)?;
                prev_id = Some(id);
                step = res.step;
                if step == 0 {
                    break 'values;
                }
            }
        }
        return Ok(());
    }

    let Some(window) = build_window(plan, true) else {
        return Ok(());
    };
    let iter = match &window.seek {
        Seek::FullFwd => txn.scan_prefix(&ks, &prefix)?,
        Seek::FullRev => txn.scan_prefix_rev(&ks, &prefix)?,
        Seek::FromLower(v) => {
            let mut start = prefix.clone();
            start.extend_from_slice(v);
            txn.scan_from(&ks, &prefix, &start)?
        }
        // Duplicate keyspaces never seek from the upper side; see
        // `Window::skip_above`.
        Seek::FromUpper(_) => txn.scan_prefix_rev(&ks, &prefix)?,
    };
    let mut entries = StepIter::new(iter, false);
    let mut step = 1i64;
    let mut prev_id: Option<DocId> = None;
    loop {
        let Some((key, _)) = entries.advance(step)? else {
            break;
        };
        let Some((vbytes, id)) = keys::parse_dup_key(key, &prefix, kind) else {
            return Err(DbError::Corrupted(format!(
                "unreadable index entry in {collection}"
            )));
        };
        if window.skip(vbytes) {
            step = 1;
            continue;
        }
        if let Some(guard) = &window.prefix_guard {
            if !vbytes.starts_with(guard) {
                break;
            }
        }
        if window.past_terminal(vbytes) {
            break;
        }
        if prev_id.as_ref() == Some(&id) {
            step = 1;
            continue;
        }
        let res = consumer.accept(&id, None)?;
        prematch_driving(plan, res.matched);
        prev_id = Some(id);
        step = res.step;
        if step == 0 {
            break;
        }
    }
    Ok(())
}
