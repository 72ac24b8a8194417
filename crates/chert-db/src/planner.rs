//! Index selection.
//!
//! Walks the filter tree for *solid* leaves (conjunctive, non-negated,
//! wildcard-free, index-friendly operators), builds one candidate per
//! matching index, ranks them, and emits the scan strategy: primary-key
//! lookups, one driven index scan, or a full collection scan.

use std::sync::Arc;

use bson::Bson;
use chert_query::value::cmp_values;
use chert_query::{FilterLeaf, FilterOp, FilterTree, Join, QuerySpec};

use crate::ids::DocId;
use crate::index::{IndexHandle, IndexKind};

pub(crate) const PK_FIELD: &str = "_id";

// Empirically-tuned limits for driving a scan from an $in array: very
// large sets, or sets close to the index size, scan worse than a walk.
const MAX_INOP_ARRAY_SIZE: usize = 500;
const MIN_INOP_ARRAY_SIZE: usize = 10;
const MAX_INOP_ARRAY_RATIO: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorDir {
    Fwd,
    Rev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorInit {
    /// Before the first entry of the index region.
    First,
    /// After the last entry (reverse walks).
    Last,
    /// Point lookup(s) on expr1's value(s).
    Eq,
    /// Seek to the first entry `>=` expr1's lower bound.
    LowerBound,
    /// Seek to the last entry `<=` expr1's upper bound (reverse walks).
    UpperBound,
}

impl CursorInit {
    pub fn log_name(self) -> &'static str {
        match self {
            CursorInit::First => "BEFORE_FIRST",
            CursorInit::Last => "AFTER_LAST",
            CursorInit::Eq => "EQ",
            CursorInit::LowerBound => "GE",
            CursorInit::UpperBound => "LE",
        }
    }
}

impl CursorDir {
    pub fn log_name(self) -> &'static str {
        match self {
            CursorDir::Fwd => "NEXT",
            CursorDir::Rev => "PREV",
        }
    }
}

/// One driven index scan: the chosen index, the driving expression
/// (`expr1`), an optional fail-fast bound (`expr2`), and cursor ops.
#[derive(Debug)]
pub(crate) struct IndexScanPlan<'q> {
    pub idx: Arc<IndexHandle>,
    pub expr1: Option<&'q FilterLeaf>,
    pub expr2: Option<&'q FilterLeaf>,
    pub init: CursorInit,
    pub dir: CursorDir,
    pub orderby_support: bool,
}

#[derive(Debug)]
pub(crate) enum ScanStrategy<'q> {
    /// `_id` equality / membership — bypasses the index layer entirely.
    PrimaryKey { ids: Vec<DocId> },
    Index(IndexScanPlan<'q>),
    Full { dir: CursorDir },
}

#[derive(Debug)]
pub(crate) struct QueryPlan<'q> {
    pub scan: ScanStrategy<'q>,
    pub sorting: bool,
}

/// Compute the scan strategy for a parsed query against the collection's
/// declared indexes.
pub(crate) fn plan<'q>(spec: &'q QuerySpec, indexes: &[Arc<IndexHandle>]) -> QueryPlan<'q> {
    let mut solid = Vec::new();
    if let Some(tree) = &spec.filter {
        collect_solid(tree, &mut solid);
    }

    // Primary-key shortcut: _id equality or membership reads the primary
    // map directly.
    for leaf in &solid {
        if leaf.path.as_str() != PK_FIELD {
            continue;
        }
        let ids: Vec<DocId> = match &leaf.op {
            FilterOp::Eq(v) => DocId::from_bson(v).into_iter().collect(),
            FilterOp::In(vs) => {
                let converted: Vec<DocId> = vs.iter().filter_map(DocId::from_bson).collect();
                if converted.len() != vs.len() {
                    continue; // unconvertible members fall back to scanning
                }
                converted
            }
            _ => continue,
        };
        leaf.prematched.set(true);
        return QueryPlan {
            scan: ScanStrategy::PrimaryKey { ids },
            sorting: !spec.order.is_empty(),
        };
    }

    let mut candidates: Vec<IndexScanPlan<'q>> = Vec::new();
    for idx in indexes {
        if let Some(candidate) = build_candidate(idx, &solid, spec) {
            candidates.push(candidate);
        }
    }

    if !candidates.is_empty() {
        candidates.sort_by(|a, b| {
            candidate_weight(b)
                .cmp(&candidate_weight(a))
                .then_with(|| b.expr2.is_some().cmp(&a.expr2.is_some()))
                .then_with(|| a.idx.row_count().cmp(&b.idx.row_count()))
                .then_with(|| a.idx.meta.path.len().cmp(&b.idx.meta.path.len()))
        });
        let winner = candidates.remove(0);
        if let Some(expr1) = winner.expr1 {
            let prematched = match &expr1.op {
                FilterOp::Eq(_) | FilterOp::In(_) => true,
                FilterOp::Gte(_) => winner.init == CursorInit::LowerBound,
                _ => false,
            };
            if prematched {
                expr1.prematched.set(true);
            }
        }
        let sorting = !spec.order.is_empty() && !winner.orderby_support;
        return QueryPlan {
            scan: ScanStrategy::Index(winner),
            sorting,
        };
    }

    // No filter candidate. Last chance to avoid sorting: a single
    // $orderby key with an exactly-matching index (or the primary map
    // itself) provides scan order.
    if spec.order.len() == 1 {
        let key = &spec.order[0];
        let dir = if key.descending {
            CursorDir::Rev
        } else {
            CursorDir::Fwd
        };
        if key.path.as_str() == PK_FIELD {
            return QueryPlan {
                scan: ScanStrategy::Full { dir },
                sorting: false,
            };
        }
        if let Some(idx) = indexes.iter().find(|i| i.meta.path == key.path.as_str()) {
            return QueryPlan {
                scan: ScanStrategy::Index(IndexScanPlan {
                    idx: Arc::clone(idx),
                    expr1: None,
                    expr2: None,
                    init: if key.descending {
                        CursorInit::Last
                    } else {
                        CursorInit::First
                    },
                    dir,
                    orderby_support: true,
                }),
                sorting: false,
            };
        }
    }

    QueryPlan {
        scan: ScanStrategy::Full { dir: CursorDir::Fwd },
        sorting: !spec.order.is_empty(),
    }
}

/// Gather leaves usable for index selection: reachable through
/// conjunctions only, not negated, plain paths, index-friendly operators.
fn collect_solid<'q>(tree: &'q FilterTree, out: &mut Vec<&'q FilterLeaf>) {
    match tree {
        FilterTree::Leaf(leaf) => {
            if !leaf.negate && !leaf.path.has_wildcard() && solid_op(&leaf.op) {
                out.push(leaf);
            }
        }
        FilterTree::Group {
            join: Join::And,
            negate: false,
            children,
        } => {
            for child in children {
                collect_solid(child, out);
            }
        }
        // Disjunctive or negated subtrees contribute nothing.
        FilterTree::Group { .. } => {}
    }
}

fn solid_op(op: &FilterOp) -> bool {
    match op {
        FilterOp::Eq(_)
        | FilterOp::In(_)
        | FilterOp::Gt(_)
        | FilterOp::Gte(_)
        | FilterOp::Lt(_)
        | FilterOp::Lte(_)
        | FilterOp::Between(..) => true,
        // Only a single prefix can drive a sorted scan.
        FilterOp::Prefix(prefixes) => prefixes.len() == 1,
        _ => false,
    }
}

fn in_array_eligible(len: usize, rows: u64) -> bool {
    if len > MAX_INOP_ARRAY_SIZE {
        return false;
    }
    if len > MIN_INOP_ARRAY_SIZE && rows < len as u64 * MAX_INOP_ARRAY_RATIO {
        return false;
    }
    true
}

pub(crate) fn leaf_lower_bound(leaf: &FilterLeaf) -> Option<&Bson> {
    match &leaf.op {
        FilterOp::Gt(v) | FilterOp::Gte(v) => Some(v),
        FilterOp::Between(lo, _) => Some(lo),
        _ => None,
    }
}

pub(crate) fn leaf_upper_bound(leaf: &FilterLeaf) -> Option<&Bson> {
    match &leaf.op {
        FilterOp::Lt(v) | FilterOp::Lte(v) => Some(v),
        FilterOp::Between(_, hi) => Some(hi),
        _ => None,
    }
}

/// Walk the index-relevant leaves in source order, tightening the two
/// bounding expressions and the cursor ops.
fn build_candidate<'q>(
    idx: &Arc<IndexHandle>,
    solid: &[&'q FilterLeaf],
    spec: &'q QuerySpec,
) -> Option<IndexScanPlan<'q>> {
    let mut expr1: Option<&'q FilterLeaf> = None;
    let mut expr2: Option<&'q FilterLeaf> = None;
    let mut init = CursorInit::First;
    let mut dir = CursorDir::Fwd;

    for leaf in solid
        .iter()
        .copied()
        .filter(|l| l.path.as_str() == idx.meta.path)
    {
        match &leaf.op {
            FilterOp::Eq(_) => {
                expr1 = Some(leaf);
                expr2 = None;
                init = CursorInit::Eq;
                break;
            }
            FilterOp::In(vs) => {
                if init != CursorInit::Eq && in_array_eligible(vs.len(), idx.row_count()) {
                    expr1 = Some(leaf);
                    expr2 = None;
                    init = CursorInit::Eq;
                }
            }
            FilterOp::Prefix(prefixes) => {
                if init == CursorInit::Eq || idx.meta.kind != IndexKind::Str {
                    continue;
                }
                if prefixes.first().is_none_or(|p| p.is_empty()) {
                    continue;
                }
                expr1 = Some(leaf);
                init = CursorInit::LowerBound;
            }
            FilterOp::Gt(_) | FilterOp::Gte(_) | FilterOp::Between(..) => {
                if init == CursorInit::Eq {
                    continue;
                }
                // Keep the tighter (larger) lower bound.
                if let (Some(prev), Some(new)) = (
                    expr1.and_then(leaf_lower_bound),
                    leaf_lower_bound(leaf),
                ) {
                    if init == CursorInit::LowerBound
                        && cmp_values(prev, new) != std::cmp::Ordering::Less
                    {
                        if let FilterOp::Between(..) = &leaf.op {
                            tighten_upper(&mut expr2, leaf);
                        }
                        continue;
                    }
                }
                expr1 = Some(leaf);
                init = CursorInit::LowerBound;
                if let FilterOp::Between(..) = &leaf.op {
                    tighten_upper(&mut expr2, leaf);
                }
            }
            FilterOp::Lt(_) | FilterOp::Lte(_) => {
                tighten_upper(&mut expr2, leaf);
            }
            _ => {}
        }
    }

    // An upper bound alone still drives a scan: walk from the front and
    // fail fast at the bound.
    if expr1.is_none() {
        expr1 = expr2;
    }
    expr1?;

    let mut orderby_support = spec.order.len() == 1
        && spec.order[0].path.as_str() == idx.meta.path
        && init != CursorInit::Eq;

    if orderby_support && spec.order[0].descending {
        // A descending walk needs an upper starting point.
        let driving_upper = expr1.is_some_and(|l| {
            matches!(l.op, FilterOp::Lt(_) | FilterOp::Lte(_) | FilterOp::Between(..))
        });
        if driving_upper {
            // Between keeps its own lower bound as the fail-fast check;
            // a bare upper bound has nothing to stop at early.
            init = CursorInit::UpperBound;
            dir = CursorDir::Rev;
        } else if let Some(upper) = expr2 {
            expr2 = expr1;
            expr1 = Some(upper);
            init = CursorInit::UpperBound;
            dir = CursorDir::Rev;
        } else {
            orderby_support = false;
        }
    }

    Some(IndexScanPlan {
        idx: Arc::clone(idx),
        expr1,
        expr2,
        init,
        dir,
        orderby_support,
    })
}

fn tighten_upper<'q>(expr2: &mut Option<&'q FilterLeaf>, leaf: &'q FilterLeaf) {
    match (expr2.and_then(leaf_upper_bound), leaf_upper_bound(leaf)) {
        (Some(prev), Some(new)) => {
            if cmp_values(new, prev) == std::cmp::Ordering::Less {
                *expr2 = Some(leaf);
            }
        }
        (None, Some(_)) => *expr2 = Some(leaf),
        _ => {}
    }
}

fn candidate_weight(c: &IndexScanPlan<'_>) -> i32 {
    let Some(expr1) = c.expr1 else {
        return 0;
    };
    match &expr1.op {
        FilterOp::Eq(_) => return 10,
        FilterOp::In(_) => return 9,
        _ => {}
    }
    if c.orderby_support {
        return 8;
    }
    match &expr1.op {
        FilterOp::Gt(_) | FilterOp::Gte(_) | FilterOp::Between(..) => 7,
        FilterOp::Prefix(_) => 6,
        FilterOp::Lt(_) | FilterOp::Lte(_) => 5,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexMeta;
    use bson::rawdoc;
    use chert_query::parse_query;

    fn idx(path: &str, kind: IndexKind, rows: u64) -> Arc<IndexHandle> {
        Arc::new(IndexHandle::new(
            IndexMeta {
                path: path.into(),
                kind,
                unique: false,
            },
            rows,
        ))
    }

    fn parse(doc: &bson::RawDocumentBuf) -> QuerySpec {
        parse_query(doc).unwrap()
    }

    #[test]
    fn no_indexes_full_scan() {
        let spec = parse(&rawdoc! { "a": 1 });
        let plan = plan(&spec, &[]);
        assert!(matches!(plan.scan, ScanStrategy::Full { dir: CursorDir::Fwd }));
        assert!(!plan.sorting);
    }

    #[test]
    fn orderby_without_index_requires_sorting() {
        let spec = parse(&rawdoc! { "a": 1, "$orderby": { "name": 1 } });
        let plan = plan(&spec, &[]);
        assert!(matches!(plan.scan, ScanStrategy::Full { .. }));
        assert!(plan.sorting);
    }

    #[test]
    fn pk_eq_uses_primary_key_scan() {
        let spec = parse(&rawdoc! { "_id": "A" });
        let plan = plan(&spec, &[]);
        match plan.scan {
            ScanStrategy::PrimaryKey { ids } => {
                assert_eq!(ids, vec![DocId::Str("A".into())]);
            }
            other => panic!("expected primary key scan, got {other:?}"),
        }
    }

    #[test]
    fn pk_in_converts_all_members() {
        let spec = parse(&rawdoc! { "_id": { "$in": ["A", "C"] } });
        let plan = plan(&spec, &[]);
        match plan.scan {
            ScanStrategy::PrimaryKey { ids } => assert_eq!(ids.len(), 2),
            other => panic!("expected primary key scan, got {other:?}"),
        }
    }

    #[test]
    fn eq_on_indexed_field_selects_index() {
        let indexes = [idx("zip", IndexKind::Str, 100)];
        let spec = parse(&rawdoc! { "zip": "630090" });
        let plan = plan(&spec, &indexes);
        match &plan.scan {
            ScanStrategy::Index(p) => {
                assert_eq!(p.idx.meta.path, "zip");
                assert_eq!(p.init, CursorInit::Eq);
                assert!(p.expr1.unwrap().prematched.get());
            }
            other => panic!("expected index scan, got {other:?}"),
        }
    }

    #[test]
    fn eq_beats_range_on_another_index() {
        let indexes = [
            idx("age", IndexKind::I64, 1000),
            idx("status", IndexKind::Str, 1000),
        ];
        let spec = parse(&rawdoc! { "age": { "$gt": 25 }, "status": "active" });
        let plan = plan(&spec, &indexes);
        match &plan.scan {
            ScanStrategy::Index(p) => assert_eq!(p.idx.meta.path, "status"),
            other => panic!("expected index scan, got {other:?}"),
        }
    }

    #[test]
    fn two_sided_range_beats_one_sided_at_equal_weight() {
        let indexes = [
            idx("a", IndexKind::I64, 1000),
            idx("b", IndexKind::I64, 1000),
        ];
        let spec = parse(&rawdoc! { "a": { "$gt": 1 }, "b": { "$gt": 1, "$lt": 10 } });
        let plan = plan(&spec, &indexes);
        match &plan.scan {
            ScanStrategy::Index(p) => {
                assert_eq!(p.idx.meta.path, "b");
                assert!(p.expr2.is_some());
            }
            other => panic!("expected index scan, got {other:?}"),
        }
    }

    #[test]
    fn smaller_index_wins_ties() {
        let indexes = [
            idx("a", IndexKind::I64, 5000),
            idx("b", IndexKind::I64, 10),
        ];
        let spec = parse(&rawdoc! { "a": 1, "b": 2 });
        let plan = plan(&spec, &indexes);
        match &plan.scan {
            ScanStrategy::Index(p) => assert_eq!(p.idx.meta.path, "b"),
            other => panic!("expected index scan, got {other:?}"),
        }
    }

    #[test]
    fn or_disables_index_use() {
        let indexes = [idx("a", IndexKind::I64, 100)];
        let spec = parse(&rawdoc! { "$or": [ { "a": 1 }, { "a": 2 } ] });
        let plan = plan(&spec, &indexes);
        assert!(matches!(plan.scan, ScanStrategy::Full { .. }));
    }

    #[test]
    fn negated_leaf_is_not_solid() {
        let indexes = [idx("a", IndexKind::I64, 100)];
        let spec = parse(&rawdoc! { "a": { "$not": 5 } });
        let plan = plan(&spec, &indexes);
        assert!(matches!(plan.scan, ScanStrategy::Full { .. }));
    }

    #[test]
    fn between_drives_scan_with_upper_check() {
        let indexes = [idx("dblscore", IndexKind::F64, 3)];
        let spec = parse(&rawdoc! { "dblscore": { "$bt": [0.95, 0.33] } });
        let plan = plan(&spec, &indexes);
        match &plan.scan {
            ScanStrategy::Index(p) => {
                assert_eq!(p.idx.meta.path, "dblscore");
                assert_eq!(p.init, CursorInit::LowerBound);
                assert!(p.expr2.is_some());
            }
            other => panic!("expected index scan, got {other:?}"),
        }
    }

    #[test]
    fn gte_is_prematched_lt_is_not() {
        let indexes = [idx("n", IndexKind::I64, 100)];
        let spec = parse(&rawdoc! { "n": { "$gte": 5 } });
        let plan_gte = plan(&spec, &indexes);
        match &plan_gte.scan {
            ScanStrategy::Index(p) => assert!(p.expr1.unwrap().prematched.get()),
            other => panic!("expected index scan, got {other:?}"),
        }

        let spec = parse(&rawdoc! { "n": { "$lt": 5 } });
        let plan_lt = plan(&spec, &indexes);
        match &plan_lt.scan {
            ScanStrategy::Index(p) => {
                assert!(!p.expr1.unwrap().prematched.get());
                assert_eq!(p.init, CursorInit::First);
            }
            other => panic!("expected index scan, got {other:?}"),
        }
    }

    #[test]
    fn orderby_support_disables_sorting() {
        let indexes = [idx("n", IndexKind::I64, 100)];
        let spec = parse(&rawdoc! { "n": { "$gte": 5 }, "$orderby": { "n": 1 } });
        let plan = plan(&spec, &indexes);
        match &plan.scan {
            ScanStrategy::Index(p) => assert!(p.orderby_support),
            other => panic!("expected index scan, got {other:?}"),
        }
        assert!(!plan.sorting);
    }

    #[test]
    fn descending_orderby_flips_two_sided_range() {
        let indexes = [idx("n", IndexKind::I64, 100)];
        let spec = parse(&rawdoc! { "n": { "$gte": 5, "$lte": 10 }, "$orderby": { "n": -1 } });
        let plan = plan(&spec, &indexes);
        match &plan.scan {
            ScanStrategy::Index(p) => {
                assert!(p.orderby_support);
                assert_eq!(p.init, CursorInit::UpperBound);
                assert_eq!(p.dir, CursorDir::Rev);
                assert!(matches!(p.expr1.unwrap().op, FilterOp::Lte(_)));
                assert!(matches!(p.expr2.unwrap().op, FilterOp::Gte(_)));
            }
            other => panic!("expected index scan, got {other:?}"),
        }
        assert!(!plan.sorting);
    }

    #[test]
    fn descending_orderby_with_lower_bound_only_sorts() {
        let indexes = [idx("n", IndexKind::I64, 100)];
        let spec = parse(&rawdoc! { "n": { "$gte": 5 }, "$orderby": { "n": -1 } });
        let plan = plan(&spec, &indexes);
        match &plan.scan {
            ScanStrategy::Index(p) => assert!(!p.orderby_support),
            other => panic!("expected index scan, got {other:?}"),
        }
        assert!(plan.sorting);
    }

    #[test]
    fn orderby_rescue_without_filter_candidates() {
        let indexes = [idx("name", IndexKind::Str, 100)];
        let spec = parse(&rawdoc! { "other": 1, "$orderby": { "name": -1 } });
        let plan = plan(&spec, &indexes);
        match &plan.scan {
            ScanStrategy::Index(p) => {
                assert!(p.expr1.is_none());
                assert_eq!(p.init, CursorInit::Last);
                assert_eq!(p.dir, CursorDir::Rev);
                assert!(p.orderby_support);
            }
            other => panic!("expected index scan, got {other:?}"),
        }
        assert!(!plan.sorting);
    }

    #[test]
    fn orderby_by_id_uses_reverse_full_scan() {
        let spec = parse(&rawdoc! { "$orderby": { "_id": -1 } });
        let plan = plan(&spec, &[]);
        assert!(matches!(plan.scan, ScanStrategy::Full { dir: CursorDir::Rev }));
        assert!(!plan.sorting);
    }

    #[test]
    fn huge_in_array_is_not_index_eligible() {
        let indexes = [idx("a", IndexKind::I64, 100)];
        let members: Vec<i64> = (0..600).collect();
        let mut doc = bson::Document::new();
        doc.insert("a", bson::doc! { "$in": members.clone() });
        let raw = bson::RawDocumentBuf::try_from(&doc).unwrap();
        let spec = parse(&raw);
        let plan = plan(&spec, &indexes);
        assert!(matches!(plan.scan, ScanStrategy::Full { .. }));
    }

    #[test]
    fn small_collection_rejects_midsize_in_array() {
        // 20 members against 100 rows: 100 < 20 * 200 — not worth it.
        let indexes = [idx("a", IndexKind::I64, 100)];
        let members: Vec<i64> = (0..20).collect();
        let mut doc = bson::Document::new();
        doc.insert("a", bson::doc! { "$in": members });
        let raw = bson::RawDocumentBuf::try_from(&doc).unwrap();
        let spec = parse(&raw);
        let plan = plan(&spec, &indexes);
        assert!(matches!(plan.scan, ScanStrategy::Full { .. }));
    }

    #[test]
    fn wildcard_path_is_not_solid() {
        let indexes = [idx("a.b", IndexKind::I64, 100)];
        let spec = parse(&rawdoc! { "a.*": 1 });
        let plan = plan(&spec, &indexes);
        assert!(matches!(plan.scan, ScanStrategy::Full { .. }));
    }
}
