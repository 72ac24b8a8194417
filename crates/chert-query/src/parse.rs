use bson::raw::RawDocument;
use bson::{Bson, Document};
use regex::Regex;

use crate::apply::UpdateOp;
use crate::filter::{FilterLeaf, FilterOp, FilterTree, Join};
use crate::path::Path;
use crate::query::{FieldsSpec, JoinClause, OrderKey, QuerySpec, SliceClause};
use crate::value::cmp_values;

/// Parse error for query documents. Carries the byte offset of the
/// offending top-level element within the source document when it can
/// be located.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParseError {
    pub message: String,
    pub offset: Option<usize>,
}

impl QueryParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            offset: None,
        }
    }
}

impl std::fmt::Display for QueryParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.offset {
            Some(off) => write!(f, "query parse error at byte {off}: {}", self.message),
            None => write!(f, "query parse error: {}", self.message),
        }
    }
}

impl std::error::Error for QueryParseError {}

/// Parse a BSON query document into a [`QuerySpec`].
///
/// Top-level keys fall into three grammatical categories: field
/// predicates (implicit AND), compound operators (`$and`, `$or`,
/// `$not`), and apply/projection/hint clauses (`$set` … `$fields`),
/// which are lifted out of the filter onto the spec.
pub fn parse_query(raw: &RawDocument) -> Result<QuerySpec, QueryParseError> {
    let doc: Document = bson::deserialize_from_slice(raw.as_bytes())
        .map_err(|e| QueryParseError::new(format!("malformed BSON: {e}")))?;

    let mut spec = QuerySpec::default();
    let mut filters: Vec<FilterTree> = Vec::new();

    for (key, value) in doc.iter() {
        let located = |e: QueryParseError| QueryParseError {
            offset: e.offset.or_else(|| element_offset(raw, key)),
            ..e
        };
        match key.as_str() {
            "$and" => filters.push(parse_logical_array(value, Join::And).map_err(located)?),
            "$or" => filters.push(parse_logical_array(value, Join::Or).map_err(located)?),
            "$not" => {
                let sub = as_document(value, "$not").map_err(located)?;
                filters.push(parse_filter_doc(sub).map_err(located)?.negated());
            }
            "$set" => parse_op_fields(value, &mut spec, "$set", |path, v| UpdateOp::Set {
                path,
                value: v,
            })
            .map_err(located)?,
            "$unset" => parse_unset_fields(value, &mut spec).map_err(located)?,
            "$inc" => parse_inc_fields(value, &mut spec).map_err(located)?,
            "$rename" => parse_rename_fields(value, &mut spec).map_err(located)?,
            "$addToSet" => parse_op_fields(value, &mut spec, "$addToSet", |path, v| {
                UpdateOp::AddToSet {
                    path,
                    values: vec![v],
                }
            })
            .map_err(located)?,
            "$addToSetAll" => {
                parse_all_fields(value, &mut spec, "$addToSetAll", |path, vs| {
                    UpdateOp::AddToSet { path, values: vs }
                })
                .map_err(located)?
            }
            "$push" => parse_op_fields(value, &mut spec, "$push", |path, v| UpdateOp::Push {
                path,
                values: vec![v],
            })
            .map_err(located)?,
            "$pushAll" => parse_all_fields(value, &mut spec, "$pushAll", |path, vs| {
                UpdateOp::Push { path, values: vs }
            })
            .map_err(located)?,
            "$pull" => parse_op_fields(value, &mut spec, "$pull", |path, v| UpdateOp::Pull {
                path,
                values: vec![v],
            })
            .map_err(located)?,
            "$pullAll" => parse_all_fields(value, &mut spec, "$pullAll", |path, vs| {
                UpdateOp::Pull { path, values: vs }
            })
            .map_err(located)?,
            "$upsert" => {
                let sub = as_document(value, "$upsert").map_err(located)?;
                spec.apply.upsert = Some(sub.clone());
            }
            "$dropall" => match value {
                Bson::Boolean(b) => spec.apply.dropall = *b,
                _ => return Err(located(QueryParseError::new("$dropall must be a boolean"))),
            },
            "$do" => parse_do(value, &mut spec).map_err(located)?,
            "$orderby" => parse_orderby(value, &mut spec).map_err(located)?,
            "$skip" => spec.skip = parse_non_negative(value, "$skip").map_err(located)?,
            "$max" => spec.max = Some(parse_non_negative(value, "$max").map_err(located)?),
            "$fields" => parse_fields(value, &mut spec).map_err(located)?,
            k if k.starts_with('$') => {
                return Err(located(QueryParseError::new(format!(
                    "unknown top-level operator: {k}"
                ))));
            }
            _ => filters.push(parse_field_condition(key, value).map_err(located)?),
        }
    }

    spec.filter = combine(filters);
    Ok(spec)
}

fn combine(mut filters: Vec<FilterTree>) -> Option<FilterTree> {
    match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(FilterTree::and(filters)),
    }
}

/// Parse a filter-only sub-query (inside `$and`/`$or`/`$not`/`$elemMatch`).
/// Apply and hint clauses are not allowed at this level.
fn parse_filter_doc(doc: &Document) -> Result<FilterTree, QueryParseError> {
    let mut filters = Vec::new();
    for (key, value) in doc.iter() {
        match key.as_str() {
            "$and" => filters.push(parse_logical_array(value, Join::And)?),
            "$or" => filters.push(parse_logical_array(value, Join::Or)?),
            "$not" => {
                let sub = as_document(value, "$not")?;
                filters.push(parse_filter_doc(sub)?.negated());
            }
            k if k.starts_with('$') => {
                return Err(QueryParseError::new(format!(
                    "operator not allowed in sub-query: {k}"
                )));
            }
            _ => filters.push(parse_field_condition(key, value)?),
        }
    }
    combine(filters).ok_or_else(|| QueryParseError::new("empty sub-query document"))
}

fn parse_logical_array(value: &Bson, join: Join) -> Result<FilterTree, QueryParseError> {
    let name = if join == Join::And { "$and" } else { "$or" };
    let arr = match value {
        Bson::Array(a) => a,
        _ => {
            return Err(QueryParseError::new(format!("{name} value must be an array")));
        }
    };
    let mut children = Vec::new();
    for elem in arr {
        match elem {
            Bson::Document(sub) => children.push(parse_filter_doc(sub)?),
            _ => {
                return Err(QueryParseError::new(format!(
                    "{name} array elements must be documents"
                )));
            }
        }
    }
    if children.is_empty() {
        return Err(QueryParseError::new(format!("{name} array must not be empty")));
    }
    Ok(match join {
        Join::And => FilterTree::and(children),
        Join::Or => FilterTree::or(children),
    })
}

/// Parse a field condition: implicit `$eq`, a regex literal, or an
/// operator sub-document.
fn parse_field_condition(field: &str, value: &Bson) -> Result<FilterTree, QueryParseError> {
    let path = Path::parse(field);
    if let Bson::Document(sub) = value {
        if sub.keys().next().is_some_and(|k| k.starts_with('$')) {
            return parse_operator_doc(&path, sub);
        }
    }
    if let Bson::RegularExpression(re) = value {
        return Ok(FilterTree::Leaf(FilterLeaf::new(
            path,
            FilterOp::Regex(compile_regex(re.pattern.as_str(), re.options.as_str())?),
        )));
    }
    Ok(FilterTree::Leaf(FilterLeaf::new(
        path,
        FilterOp::Eq(value.clone()),
    )))
}

/// Parse an operator sub-document like `{ "$gte": 21, "$lt": 100 }`.
fn parse_operator_doc(path: &Path, doc: &Document) -> Result<FilterTree, QueryParseError> {
    let mut conditions: Vec<FilterTree> = Vec::new();

    for (op_key, arg) in doc.iter() {
        let op = match op_key.as_str() {
            "$eq" => FilterOp::Eq(arg.clone()),
            "$gt" => FilterOp::Gt(arg.clone()),
            "$gte" => FilterOp::Gte(arg.clone()),
            "$lt" => FilterOp::Lt(arg.clone()),
            "$lte" => FilterOp::Lte(arg.clone()),
            "$in" => FilterOp::In(scalar_array(arg, "$in")?),
            "$nin" => FilterOp::NotIn(scalar_array(arg, "$nin")?),
            "$ni" => FilterOp::Contains(arg.clone()),
            "$bt" => {
                let arr = scalar_array(arg, "$bt")?;
                if arr.len() != 2 {
                    return Err(QueryParseError::new(
                        "$bt requires a two-element array [a, b]",
                    ));
                }
                let (a, b) = (arr[0].clone(), arr[1].clone());
                // Bounds are unordered in the source query.
                if cmp_values(&a, &b) == std::cmp::Ordering::Greater {
                    FilterOp::Between(b, a)
                } else {
                    FilterOp::Between(a, b)
                }
            }
            "$begin" => FilterOp::Prefix(string_args(arg, "$begin")?),
            "$icase" => parse_icase(arg)?,
            "$strand" => FilterOp::TokensAll(string_args(arg, "$strand")?),
            "$stror" => FilterOp::TokensAny(string_args(arg, "$stror")?),
            "$exists" => match arg {
                Bson::Boolean(b) => FilterOp::Exists(*b),
                _ => return Err(QueryParseError::new("$exists value must be a boolean")),
            },
            "$elemMatch" => {
                let sub = as_document(arg, "$elemMatch")?;
                FilterOp::ElemMatch(Box::new(parse_filter_doc(sub)?))
            }
            "$not" => {
                let tree = match arg {
                    Bson::Document(sub) if sub.keys().next().is_some_and(|k| k.starts_with('$')) => {
                        parse_operator_doc(path, sub)?
                    }
                    other => FilterTree::Leaf(FilterLeaf::new(
                        path.clone(),
                        FilterOp::Eq(other.clone()),
                    )),
                };
                conditions.push(tree.negated());
                continue;
            }
            k => {
                return Err(QueryParseError::new(format!("unknown field operator: {k}")));
            }
        };
        conditions.push(FilterTree::Leaf(FilterLeaf::new(path.clone(), op)));
    }

    match conditions.len() {
        0 => Err(QueryParseError::new("empty operator document")),
        1 => Ok(conditions.pop().expect("one condition")),
        _ => Ok(FilterTree::and(conditions)),
    }
}

/// `$icase` accepts a bare string (case-folded equality) or an
/// operator document containing a single `$in`.
fn parse_icase(arg: &Bson) -> Result<FilterOp, QueryParseError> {
    match arg {
        Bson::String(_) => Ok(FilterOp::IcaseEq(arg.clone())),
        Bson::Document(sub) => {
            if sub.len() == 1 {
                if let Some(inner) = sub.get("$in") {
                    return Ok(FilterOp::IcaseIn(scalar_array(inner, "$icase.$in")?));
                }
            }
            Err(QueryParseError::new(
                "$icase argument must be a string or {\"$in\": [...]}",
            ))
        }
        _ => Err(QueryParseError::new(
            "$icase argument must be a string or {\"$in\": [...]}",
        )),
    }
}

fn compile_regex(pattern: &str, options: &str) -> Result<Regex, QueryParseError> {
    let full = if options.is_empty() {
        pattern.to_string()
    } else {
        let mut prefix = String::with_capacity(4 + options.len() + pattern.len());
        prefix.push_str("(?");
        for ch in options.chars() {
            match ch {
                'i' | 's' | 'm' | 'x' => prefix.push(ch),
                c => {
                    return Err(QueryParseError::new(format!("unknown regex option: {c}")));
                }
            }
        }
        prefix.push(')');
        prefix.push_str(pattern);
        prefix
    };
    Regex::new(&full).map_err(|e| QueryParseError::new(format!("invalid regex pattern: {e}")))
}

// ── Apply clause parsing ────────────────────────────────────────

fn op_sub_doc<'a>(value: &'a Bson, name: &str) -> Result<&'a Document, QueryParseError> {
    as_document(value, name)
}

fn parse_op_fields(
    value: &Bson,
    spec: &mut QuerySpec,
    name: &str,
    make: impl Fn(Path, Bson) -> UpdateOp,
) -> Result<(), QueryParseError> {
    let sub = op_sub_doc(value, name)?;
    for (field, v) in sub.iter() {
        spec.apply.ops.push(make(Path::parse(field), v.clone()));
    }
    Ok(())
}

/// The `*All` spellings take an array per field, processed element-wise.
fn parse_all_fields(
    value: &Bson,
    spec: &mut QuerySpec,
    name: &str,
    make: impl Fn(Path, Vec<Bson>) -> UpdateOp,
) -> Result<(), QueryParseError> {
    let sub = op_sub_doc(value, name)?;
    for (field, v) in sub.iter() {
        let arr = match v {
            Bson::Array(a) => a.clone(),
            _ => {
                return Err(QueryParseError::new(format!(
                    "{name} value for '{field}' must be an array"
                )));
            }
        };
        spec.apply.ops.push(make(Path::parse(field), arr));
    }
    Ok(())
}

fn parse_unset_fields(value: &Bson, spec: &mut QuerySpec) -> Result<(), QueryParseError> {
    let sub = op_sub_doc(value, "$unset")?;
    for (field, _) in sub.iter() {
        spec.apply.ops.push(UpdateOp::Unset {
            path: Path::parse(field),
        });
    }
    Ok(())
}

fn parse_inc_fields(value: &Bson, spec: &mut QuerySpec) -> Result<(), QueryParseError> {
    let sub = op_sub_doc(value, "$inc")?;
    for (field, v) in sub.iter() {
        match v {
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {}
            _ => {
                return Err(QueryParseError::new(format!(
                    "$inc value for '{field}' must be numeric"
                )));
            }
        }
        spec.apply.ops.push(UpdateOp::Inc {
            path: Path::parse(field),
            delta: v.clone(),
        });
    }
    Ok(())
}

fn parse_rename_fields(value: &Bson, spec: &mut QuerySpec) -> Result<(), QueryParseError> {
    let sub = op_sub_doc(value, "$rename")?;
    for (field, v) in sub.iter() {
        let new_name = match v {
            Bson::String(s) => s.clone(),
            _ => {
                return Err(QueryParseError::new(format!(
                    "$rename value for '{field}' must be a string"
                )));
            }
        };
        spec.apply.ops.push(UpdateOp::Rename {
            path: Path::parse(field),
            new_name,
        });
    }
    Ok(())
}

/// `$do: { "<field>": { "$join": "<coll>" } | { "$slice": n | [skip, n] } }`
fn parse_do(value: &Bson, spec: &mut QuerySpec) -> Result<(), QueryParseError> {
    let sub = op_sub_doc(value, "$do")?;
    for (field, action) in sub.iter() {
        let action = as_document(action, "$do action")?;
        for (verb, arg) in action.iter() {
            match verb.as_str() {
                "$join" => match arg {
                    Bson::String(coll) => spec.joins.push(JoinClause {
                        path: Path::parse(field),
                        collection: coll.clone(),
                    }),
                    _ => {
                        return Err(QueryParseError::new("$join argument must be a collection name"));
                    }
                },
                "$slice" => {
                    let (skip, limit) = match arg {
                        Bson::Int32(n) if *n >= 0 => (0, *n as u64),
                        Bson::Int64(n) if *n >= 0 => (0, *n as u64),
                        Bson::Array(a) if a.len() == 2 => {
                            let s = int_arg(&a[0], "$slice skip")?;
                            let l = int_arg(&a[1], "$slice limit")?;
                            (s, l)
                        }
                        _ => {
                            return Err(QueryParseError::new(
                                "$slice argument must be a limit or [skip, limit]",
                            ));
                        }
                    };
                    spec.slices.push(SliceClause {
                        path: Path::parse(field),
                        skip,
                        limit,
                    });
                }
                other => {
                    return Err(QueryParseError::new(format!("unknown $do action: {other}")));
                }
            }
        }
    }
    Ok(())
}

fn parse_orderby(value: &Bson, spec: &mut QuerySpec) -> Result<(), QueryParseError> {
    let sub = op_sub_doc(value, "$orderby")?;
    for (field, dir) in sub.iter() {
        let descending = match dir {
            Bson::Int32(n) => *n < 0,
            Bson::Int64(n) => *n < 0,
            Bson::Double(f) => *f < 0.0,
            _ => {
                return Err(QueryParseError::new(format!(
                    "$orderby direction for '{field}' must be 1 or -1"
                )));
            }
        };
        spec.order.push(OrderKey {
            path: Path::parse(field),
            descending,
        });
    }
    Ok(())
}

fn parse_fields(value: &Bson, spec: &mut QuerySpec) -> Result<(), QueryParseError> {
    let sub = op_sub_doc(value, "$fields")?;
    let mut include: Option<bool> = None;
    let mut paths = Vec::new();
    for (field, flag) in sub.iter() {
        let on = match flag {
            Bson::Int32(n) => *n != 0,
            Bson::Int64(n) => *n != 0,
            Bson::Boolean(b) => *b,
            _ => {
                return Err(QueryParseError::new(format!(
                    "$fields value for '{field}' must be 0 or 1"
                )));
            }
        };
        match include {
            None => include = Some(on),
            Some(prev) if prev != on => {
                return Err(QueryParseError::new(
                    "$fields cannot mix include and exclude entries",
                ));
            }
            Some(_) => {}
        }
        paths.push(Path::parse(field));
    }
    if let Some(include) = include {
        spec.fields = Some(FieldsSpec { include, paths });
    }
    Ok(())
}

// ── Small argument helpers ──────────────────────────────────────

fn as_document<'a>(value: &'a Bson, name: &str) -> Result<&'a Document, QueryParseError> {
    match value {
        Bson::Document(d) => Ok(d),
        _ => Err(QueryParseError::new(format!("{name} value must be a document"))),
    }
}

fn scalar_array(value: &Bson, name: &str) -> Result<Vec<Bson>, QueryParseError> {
    match value {
        Bson::Array(a) => Ok(a.clone()),
        _ => Err(QueryParseError::new(format!("{name} value must be an array"))),
    }
}

fn string_args(value: &Bson, name: &str) -> Result<Vec<String>, QueryParseError> {
    match value {
        Bson::String(s) => Ok(vec![s.clone()]),
        Bson::Array(a) => a
            .iter()
            .map(|v| match v {
                Bson::String(s) => Ok(s.clone()),
                _ => Err(QueryParseError::new(format!(
                    "{name} array elements must be strings"
                ))),
            })
            .collect(),
        _ => Err(QueryParseError::new(format!(
            "{name} value must be a string or array of strings"
        ))),
    }
}

fn int_arg(value: &Bson, name: &str) -> Result<u64, QueryParseError> {
    match value {
        Bson::Int32(n) if *n >= 0 => Ok(*n as u64),
        Bson::Int64(n) if *n >= 0 => Ok(*n as u64),
        _ => Err(QueryParseError::new(format!(
            "{name} must be a non-negative integer"
        ))),
    }
}

fn parse_non_negative(value: &Bson, name: &str) -> Result<u64, QueryParseError> {
    match value {
        Bson::Int32(n) if *n >= 0 => Ok(*n as u64),
        Bson::Int64(n) if *n >= 0 => Ok(*n as u64),
        Bson::Int32(_) | Bson::Int64(_) => Err(QueryParseError::new(format!(
            "{name} must not be negative"
        ))),
        _ => Err(QueryParseError::new(format!("{name} must be an integer"))),
    }
}

// ── Byte offsets for diagnostics ────────────────────────────────

fn read_i32(bytes: &[u8], pos: usize) -> Option<i32> {
    let end = pos.checked_add(4)?;
    let slice = bytes.get(pos..end)?;
    Some(i32::from_le_bytes(slice.try_into().ok()?))
}

/// Byte offset of a top-level element (its type byte) inside a raw BSON
/// document. Walks the document's wire format directly so errors can
/// point back into the source bytes.
fn element_offset(raw: &RawDocument, target_key: &str) -> Option<usize> {
    let bytes = raw.as_bytes();
    if bytes.len() < 5 {
        return None;
    }
    let mut pos = 4;
    while pos < bytes.len() && bytes[pos] != 0 {
        let elem_start = pos;
        let tag = bytes[pos];
        pos += 1;
        let key_start = pos;
        while pos < bytes.len() && bytes[pos] != 0 {
            pos += 1;
        }
        let key = std::str::from_utf8(&bytes[key_start..pos]).ok()?;
        pos += 1;
        let value_len = match tag {
            0x01 | 0x09 | 0x11 | 0x12 => 8,
            0x02 | 0x0d | 0x0e => 4 + read_i32(bytes, pos)?.max(0) as usize,
            0x03 | 0x04 => read_i32(bytes, pos)?.max(0) as usize,
            0x05 => 4 + 1 + read_i32(bytes, pos)?.max(0) as usize,
            0x06 | 0x0a | 0x7f | 0xff => 0,
            0x07 => 12,
            0x08 => 1,
            0x0b => {
                let mut p = pos;
                while p < bytes.len() && bytes[p] != 0 {
                    p += 1;
                }
                p += 1;
                while p < bytes.len() && bytes[p] != 0 {
                    p += 1;
                }
                p + 1 - pos
            }
            0x10 => 4,
            0x13 => 16,
            _ => return None,
        };
        if key == target_key {
            return Some(elem_start);
        }
        pos += value_len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::rawdoc;

    fn parse(raw: &bson::RawDocumentBuf) -> QuerySpec {
        parse_query(raw).unwrap()
    }

    #[test]
    fn bare_field_is_implicit_eq() {
        let q = parse(&rawdoc! { "status": "active" });
        match q.filter.unwrap() {
            FilterTree::Leaf(leaf) => {
                assert_eq!(leaf.path.as_str(), "status");
                assert!(matches!(leaf.op, FilterOp::Eq(Bson::String(ref s)) if s == "active"));
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn multiple_fields_become_and() {
        let q = parse(&rawdoc! { "a": 1, "b": 2 });
        match q.filter.unwrap() {
            FilterTree::Group { join, children, .. } => {
                assert_eq!(join, Join::And);
                assert_eq!(children.len(), 2);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn operator_documents() {
        let q = parse(&rawdoc! { "age": { "$gte": 21, "$lt": 65 } });
        assert_eq!(q.filter.unwrap().leaf_count(), 2);
    }

    #[test]
    fn bt_normalises_unordered_bounds() {
        let q = parse(&rawdoc! { "x": { "$bt": [0.95, 0.33] } });
        match q.filter.unwrap() {
            FilterTree::Leaf(leaf) => match leaf.op {
                FilterOp::Between(lo, hi) => {
                    assert_eq!(lo, Bson::Double(0.33));
                    assert_eq!(hi, Bson::Double(0.95));
                }
                other => panic!("expected Between, got {other:?}"),
            },
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn or_with_nested_and() {
        let q = parse(&rawdoc! {
            "$or": [ { "a": 1 }, { "$and": [ { "b": 2 }, { "c": 3 } ] } ]
        });
        let tree = q.filter.unwrap();
        assert_eq!(tree.or_count(), 1);
        assert_eq!(tree.leaf_count(), 3);
    }

    #[test]
    fn not_negates_subtree() {
        let q = parse(&rawdoc! { "$not": { "a": 1 } });
        match q.filter.unwrap() {
            FilterTree::Leaf(leaf) => assert!(leaf.negate),
            FilterTree::Group { negate, .. } => assert!(negate),
        }
    }

    #[test]
    fn field_level_not() {
        let q = parse(&rawdoc! { "a": { "$not": { "$gt": 5 } } });
        match q.filter.unwrap() {
            FilterTree::Leaf(leaf) => {
                assert!(leaf.negate);
                assert!(matches!(leaf.op, FilterOp::Gt(_)));
            }
            other => panic!("expected negated leaf, got {other:?}"),
        }
    }

    #[test]
    fn apply_clauses_are_lifted() {
        let q = parse(&rawdoc! {
            "name": "x",
            "$set": { "a": 1 },
            "$inc": { "n": 2 },
            "$addToSet": { "tags": "red" }
        });
        assert!(q.filter.is_some());
        assert_eq!(q.apply.ops.len(), 3);
        assert!(q.has_mutation());
    }

    #[test]
    fn push_all_requires_arrays() {
        let err = parse_query(&rawdoc! { "$pushAll": { "tags": "not-an-array" } }).unwrap_err();
        assert!(err.message.contains("must be an array"), "{}", err.message);
    }

    #[test]
    fn upsert_and_dropall() {
        let q = parse(&rawdoc! { "cde": "fgh", "$upsert": { "cde": "fgh", "ijk": "lmn" } });
        assert!(q.apply.upsert.is_some());
        let q = parse(&rawdoc! { "a": 1, "$dropall": true });
        assert!(q.apply.dropall);
    }

    #[test]
    fn do_join_and_slice() {
        let q = parse(&rawdoc! {
            "$do": {
                "author": { "$join": "users" },
                "comments": { "$slice": [10, 5] }
            }
        });
        assert_eq!(q.joins.len(), 1);
        assert_eq!(q.joins[0].collection, "users");
        assert_eq!(q.slices.len(), 1);
        assert_eq!((q.slices[0].skip, q.slices[0].limit), (10, 5));
    }

    #[test]
    fn orderby_skip_max() {
        let q = parse(&rawdoc! { "$orderby": { "name": 1, "age": -1 }, "$skip": 3, "$max": 10 });
        assert_eq!(q.order.len(), 2);
        assert!(!q.order[0].descending);
        assert!(q.order[1].descending);
        assert_eq!(q.skip, 3);
        assert_eq!(q.max, Some(10));
    }

    #[test]
    fn negative_skip_errors_with_offset() {
        let err = parse_query(&rawdoc! { "a": 1, "$skip": -1 }).unwrap_err();
        assert!(err.message.contains("negative"), "{}", err.message);
        assert!(err.offset.is_some());
    }

    #[test]
    fn fields_mixed_include_exclude_errors() {
        let err = parse_query(&rawdoc! { "$fields": { "a": 1, "b": 0 } }).unwrap_err();
        assert!(err.message.contains("mix"), "{}", err.message);
    }

    #[test]
    fn fields_include_list() {
        let q = parse(&rawdoc! { "$fields": { "a": 1, "b.c": 1 } });
        let fields = q.fields.unwrap();
        assert!(fields.include);
        assert_eq!(fields.paths.len(), 2);
    }

    #[test]
    fn unknown_top_level_operator_errors() {
        let err = parse_query(&rawdoc! { "$frobnicate": 1 }).unwrap_err();
        assert!(err.message.contains("unknown top-level"), "{}", err.message);
    }

    #[test]
    fn unknown_field_operator_errors() {
        let err = parse_query(&rawdoc! { "a": { "$almost": 1 } }).unwrap_err();
        assert!(err.message.contains("unknown field operator"), "{}", err.message);
    }

    #[test]
    fn apply_keys_rejected_in_subquery() {
        let err = parse_query(&rawdoc! { "$or": [ { "$set": { "a": 1 } } ] }).unwrap_err();
        assert!(err.message.contains("not allowed"), "{}", err.message);
    }

    #[test]
    fn elem_match_parses_subtree() {
        let q = parse(&rawdoc! { "arr": { "$elemMatch": { "k": "t", "v": "b" } } });
        match q.filter.unwrap() {
            FilterTree::Leaf(leaf) => match leaf.op {
                FilterOp::ElemMatch(sub) => assert_eq!(sub.leaf_count(), 2),
                other => panic!("expected ElemMatch, got {other:?}"),
            },
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn icase_forms() {
        let q = parse(&rawdoc! { "city": { "$icase": "moscow" } });
        assert!(matches!(
            q.filter.unwrap(),
            FilterTree::Leaf(FilterLeaf { op: FilterOp::IcaseEq(_), .. })
        ));
        let q = parse(&rawdoc! { "city": { "$icase": { "$in": ["a", "b"] } } });
        assert!(matches!(
            q.filter.unwrap(),
            FilterTree::Leaf(FilterLeaf { op: FilterOp::IcaseIn(_), .. })
        ));
    }

    #[test]
    fn element_offset_walks_wire_format() {
        let raw = rawdoc! { "first": 1, "second": "two", "third": { "x": true } };
        let off_first = element_offset(&raw, "first").unwrap();
        let off_second = element_offset(&raw, "second").unwrap();
        let off_third = element_offset(&raw, "third").unwrap();
        assert_eq!(off_first, 4);
        assert!(off_first < off_second && off_second < off_third);
        assert!(element_offset(&raw, "missing").is_none());
    }
}
