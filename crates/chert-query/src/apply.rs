use bson::{Bson, Document};

use crate::path::{Path, Segment};
use crate::value::values_equal;

/// A single update operator lifted out of a query document.
///
/// The `*All` spellings are normalised into the multi-value forms:
/// `$addToSet` carries one value, `$addToSetAll` many, and so on.
#[derive(Debug, Clone)]
pub enum UpdateOp {
    Set { path: Path, value: Bson },
    Unset { path: Path },
    Inc { path: Path, delta: Bson },
    Rename { path: Path, new_name: String },
    AddToSet { path: Path, values: Vec<Bson> },
    Push { path: Path, values: Vec<Bson> },
    Pull { path: Path, values: Vec<Bson> },
}

impl UpdateOp {
    /// The path this operator touches (for index snapshotting, the
    /// target path; `$rename` touches both old and new names).
    pub fn path(&self) -> &Path {
        match self {
            UpdateOp::Set { path, .. }
            | UpdateOp::Unset { path }
            | UpdateOp::Inc { path, .. }
            | UpdateOp::Rename { path, .. }
            | UpdateOp::AddToSet { path, .. }
            | UpdateOp::Push { path, .. }
            | UpdateOp::Pull { path, .. } => path,
        }
    }
}

/// Mutation half of a query: update operators, the `$upsert` template
/// and the `$dropall` flag.
#[derive(Debug, Clone, Default)]
pub struct ApplySpec {
    pub ops: Vec<UpdateOp>,
    pub upsert: Option<Document>,
    pub dropall: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// `$inc` hit an existing non-numeric value.
    NonNumericIncTarget(String),
    /// Operator target cannot be mutated (wildcard path, `$rename` across
    /// parents, index segment into a non-array).
    InvalidTarget(String),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::NonNumericIncTarget(path) => {
                write!(f, "$inc target is not numeric: {path}")
            }
            ApplyError::InvalidTarget(msg) => write!(f, "invalid update target: {msg}"),
        }
    }
}

impl std::error::Error for ApplyError {}

/// Where an update path landed: a document field or an array slot.
enum Place<'a> {
    Field(&'a mut Document, String),
    Slot(&'a mut Vec<Bson>, usize),
}

/// Descend to the parent of the last path segment.
///
/// With `create` set, missing intermediate documents are created along
/// the way; array-index segments may extend arrays with nulls. Without
/// it, a missing step resolves to `None` and the operator is a no-op.
fn resolve_place<'a>(
    doc: &'a mut Document,
    path: &Path,
    create: bool,
) -> Result<Option<Place<'a>>, ApplyError> {
    let segments = path.segments();
    if segments.is_empty() {
        return Err(ApplyError::InvalidTarget("empty path".into()));
    }
    if segments
        .iter()
        .any(|s| matches!(s, Segment::Any | Segment::Deep))
    {
        return Err(ApplyError::InvalidTarget(format!(
            "wildcard path in update operator: {path}"
        )));
    }

    let (last, init) = segments.split_last().expect("non-empty");
    let mut node = DocOrArr::Doc(doc);

    for seg in init {
        let Segment::Key(k) = seg else { unreachable!() };
        node = match node {
            DocOrArr::Doc(d) => {
                if create && !d.contains_key(k) {
                    d.insert(k.clone(), Document::new());
                }
                match d.get_mut(k) {
                    Some(Bson::Document(sub)) => DocOrArr::Doc(sub),
                    Some(Bson::Array(arr)) => DocOrArr::Arr(arr),
                    Some(_) | None => return Ok(None),
                }
            }
            DocOrArr::Arr(arr) => {
                let Ok(idx) = k.parse::<usize>() else {
                    return Ok(None);
                };
                if idx >= arr.len() {
                    if !create {
                        return Ok(None);
                    }
                    arr.resize(idx + 1, Bson::Null);
                    arr[idx] = Bson::Document(Document::new());
                }
                match &mut arr[idx] {
                    Bson::Document(sub) => DocOrArr::Doc(sub),
                    Bson::Array(sub) => DocOrArr::Arr(sub),
                    slot if create && matches!(slot, Bson::Null) => {
                        *slot = Bson::Document(Document::new());
                        match slot {
                            Bson::Document(sub) => DocOrArr::Doc(sub),
                            _ => unreachable!(),
                        }
                    }
                    _ => return Ok(None),
                }
            }
        };
    }

    let Segment::Key(leaf) = last else { unreachable!() };
    Ok(Some(match node {
        DocOrArr::Doc(d) => Place::Field(d, leaf.clone()),
        DocOrArr::Arr(arr) => {
            let Ok(idx) = leaf.parse::<usize>() else {
                return Ok(None);
            };
            Place::Slot(arr, idx)
        }
    }))
}

enum DocOrArr<'a> {
    Doc(&'a mut Document),
    Arr(&'a mut Vec<Bson>),
}

/// Apply a batch of update operators to a document tree.
///
/// Returns whether anything changed. Operators apply in source order;
/// the first error aborts the batch (the caller discards the tree).
pub fn apply_ops(doc: &mut Document, ops: &[UpdateOp]) -> Result<bool, ApplyError> {
    let mut changed = false;
    for op in ops {
        changed |= apply_one(doc, op)?;
    }
    Ok(changed)
}

fn apply_one(doc: &mut Document, op: &UpdateOp) -> Result<bool, ApplyError> {
    match op {
        UpdateOp::Set { path, value } => match resolve_place(doc, path, true)? {
            Some(Place::Field(parent, key)) => {
                let prior = parent.insert(key, value.clone());
                Ok(prior.as_ref() != Some(value))
            }
            Some(Place::Slot(arr, idx)) => {
                if idx >= arr.len() {
                    arr.resize(idx + 1, Bson::Null);
                }
                let changed = arr[idx] != *value;
                arr[idx] = value.clone();
                Ok(changed)
            }
            None => Ok(false),
        },
        UpdateOp::Unset { path } => match resolve_place(doc, path, false)? {
            Some(Place::Field(parent, key)) => Ok(parent.remove(&key).is_some()),
            Some(Place::Slot(arr, idx)) => {
                // Array slots turn into Undefined, not removed — later
                // indices keep their positions.
                if idx < arr.len() && arr[idx] != Bson::Undefined {
                    arr[idx] = Bson::Undefined;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => Ok(false),
        },
        UpdateOp::Inc { path, delta } => match resolve_place(doc, path, true)? {
            Some(Place::Field(parent, key)) => match parent.get(&key) {
                None => {
                    parent.insert(key, delta.clone());
                    Ok(true)
                }
                Some(current) => {
                    let next = add_numeric(current, delta)
                        .ok_or_else(|| ApplyError::NonNumericIncTarget(path.to_string()))?;
                    parent.insert(key, next);
                    Ok(true)
                }
            },
            Some(Place::Slot(arr, idx)) => match arr.get(idx) {
                None => Ok(false),
                Some(current) => {
                    let next = add_numeric(current, delta)
                        .ok_or_else(|| ApplyError::NonNumericIncTarget(path.to_string()))?;
                    arr[idx] = next;
                    Ok(true)
                }
            },
            None => Ok(false),
        },
        UpdateOp::Rename { path, new_name } => {
            if new_name.contains('.') {
                return Err(ApplyError::InvalidTarget(format!(
                    "$rename target must be a plain name: {new_name}"
                )));
            }
            match resolve_place(doc, path, false)? {
                Some(Place::Field(parent, key)) => match parent.remove(&key) {
                    Some(value) => {
                        parent.insert(new_name.clone(), value);
                        Ok(true)
                    }
                    None => Ok(false),
                },
                Some(Place::Slot(..)) => Err(ApplyError::InvalidTarget(
                    "$rename cannot target an array slot".into(),
                )),
                None => Ok(false),
            }
        }
        UpdateOp::AddToSet { path, values } => {
            with_array(doc, path, true, |arr| {
                let mut changed = false;
                for v in values {
                    if !arr.iter().any(|e| values_equal(e, v)) {
                        arr.push(v.clone());
                        changed = true;
                    }
                }
                changed
            })
        }
        UpdateOp::Push { path, values } => with_array(doc, path, true, |arr| {
            arr.extend(values.iter().cloned());
            !values.is_empty()
        }),
        UpdateOp::Pull { path, values } => with_array(doc, path, false, |arr| {
            let before = arr.len();
            arr.retain(|e| !values.iter().any(|v| values_equal(e, v)));
            arr.len() != before
        }),
    }
}

/// Run `f` on the array at `path`. With `create`, a missing field becomes
/// an empty array first. A non-array value at the path is left alone.
fn with_array(
    doc: &mut Document,
    path: &Path,
    create: bool,
    f: impl FnOnce(&mut Vec<Bson>) -> bool,
) -> Result<bool, ApplyError> {
    match resolve_place(doc, path, create)? {
        Some(Place::Field(parent, key)) => {
            if create && !parent.contains_key(&key) {
                parent.insert(key.clone(), Bson::Array(Vec::new()));
            }
            match parent.get_mut(&key) {
                Some(Bson::Array(arr)) => Ok(f(arr)),
                _ => Ok(false),
            }
        }
        Some(Place::Slot(arr, idx)) => match arr.get_mut(idx) {
            Some(Bson::Array(sub)) => Ok(f(sub)),
            _ => Ok(false),
        },
        None => Ok(false),
    }
}

fn add_numeric(current: &Bson, delta: &Bson) -> Option<Bson> {
    match (current, delta) {
        (Bson::Int32(a), Bson::Int32(b)) => Some(Bson::Int64(*a as i64 + *b as i64)),
        (Bson::Int32(a), Bson::Int64(b)) => Some(Bson::Int64((*a as i64).wrapping_add(*b))),
        (Bson::Int64(a), Bson::Int32(b)) => Some(Bson::Int64(a.wrapping_add(*b as i64))),
        (Bson::Int64(a), Bson::Int64(b)) => Some(Bson::Int64(a.wrapping_add(*b))),
        (Bson::Int32(a), Bson::Double(b)) => Some(Bson::Double(*a as f64 + b)),
        (Bson::Int64(a), Bson::Double(b)) => Some(Bson::Double(*a as f64 + b)),
        (Bson::Double(a), Bson::Int32(b)) => Some(Bson::Double(a + *b as f64)),
        (Bson::Double(a), Bson::Int64(b)) => Some(Bson::Double(a + *b as f64)),
        (Bson::Double(a), Bson::Double(b)) => Some(Bson::Double(a + b)),
        _ => None,
    }
}

/// RFC 7386 merge-patch over document trees.
///
/// Object values merge recursively; a null in the patch removes the
/// field; everything else replaces. Returns whether anything changed.
pub fn merge_patch(doc: &mut Document, patch: &Document) -> bool {
    let mut changed = false;
    for (key, pv) in patch.iter() {
        match pv {
            Bson::Null => {
                changed |= doc.remove(key).is_some();
            }
            Bson::Document(sub_patch) => match doc.get_mut(key) {
                Some(Bson::Document(sub)) => {
                    changed |= merge_patch(sub, sub_patch);
                }
                _ => {
                    let mut fresh = Document::new();
                    merge_patch(&mut fresh, sub_patch);
                    doc.insert(key.clone(), Bson::Document(fresh));
                    changed = true;
                }
            },
            other => {
                if doc.get(key) != Some(other) {
                    doc.insert(key.clone(), other.clone());
                    changed = true;
                }
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn set(path: &str, value: Bson) -> UpdateOp {
        UpdateOp::Set {
            path: Path::parse(path),
            value,
        }
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut d = doc! { "a": 1 };
        let changed = apply_ops(&mut d, &[set("x.y.z", Bson::Int32(5))]).unwrap();
        assert!(changed);
        assert_eq!(d, doc! { "a": 1, "x": { "y": { "z": 5 } } });
    }

    #[test]
    fn set_array_index_extends_with_nulls() {
        let mut d = doc! { "arr": [1] };
        apply_ops(&mut d, &[set("arr.3", Bson::Int32(9))]).unwrap();
        assert_eq!(d, doc! { "arr": [1, Bson::Null, Bson::Null, 9] });
    }

    #[test]
    fn set_same_value_reports_unchanged() {
        let mut d = doc! { "a": 1 };
        let changed = apply_ops(&mut d, &[set("a", Bson::Int32(1))]).unwrap();
        assert!(!changed);
    }

    #[test]
    fn unset_removes_field_but_undefines_array_slot() {
        let mut d = doc! { "a": 1, "arr": [1, 2, 3] };
        apply_ops(
            &mut d,
            &[
                UpdateOp::Unset {
                    path: Path::parse("a"),
                },
                UpdateOp::Unset {
                    path: Path::parse("arr.1"),
                },
            ],
        )
        .unwrap();
        assert_eq!(d, doc! { "arr": [1, Bson::Undefined, 3] });
    }

    #[test]
    fn inc_creates_and_accumulates() {
        let mut d = doc! {};
        let inc = |n| UpdateOp::Inc {
            path: Path::parse("n"),
            delta: Bson::Int64(n),
        };
        apply_ops(&mut d, &[inc(3)]).unwrap();
        apply_ops(&mut d, &[inc(4)]).unwrap();
        assert_eq!(d.get("n"), Some(&Bson::Int64(7)));
    }

    #[test]
    fn inc_pair_is_inverse() {
        let mut d = doc! { "f": 10_i64 };
        let inc = |n| UpdateOp::Inc {
            path: Path::parse("f"),
            delta: Bson::Int64(n),
        };
        for _ in 0..5 {
            apply_ops(&mut d, &[inc(7)]).unwrap();
        }
        for _ in 0..5 {
            apply_ops(&mut d, &[inc(-7)]).unwrap();
        }
        assert_eq!(d.get("f"), Some(&Bson::Int64(10)));
    }

    #[test]
    fn inc_on_string_errors() {
        let mut d = doc! { "f": "oops" };
        let err = apply_ops(
            &mut d,
            &[UpdateOp::Inc {
                path: Path::parse("f"),
                delta: Bson::Int32(1),
            }],
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::NonNumericIncTarget(_)));
    }

    #[test]
    fn rename_is_own_inverse_when_target_absent() {
        let mut d = doc! { "a": 42 };
        apply_ops(
            &mut d,
            &[UpdateOp::Rename {
                path: Path::parse("a"),
                new_name: "b".into(),
            }],
        )
        .unwrap();
        assert_eq!(d, doc! { "b": 42 });
        apply_ops(
            &mut d,
            &[UpdateOp::Rename {
                path: Path::parse("b"),
                new_name: "a".into(),
            }],
        )
        .unwrap();
        assert_eq!(d, doc! { "a": 42 });
    }

    #[test]
    fn add_to_set_is_idempotent() {
        let mut d = doc! { "labels": ["green"] };
        let op = UpdateOp::AddToSet {
            path: Path::parse("labels"),
            values: vec![Bson::String("green".into())],
        };
        let changed = apply_ops(&mut d, std::slice::from_ref(&op)).unwrap();
        assert!(!changed);
        apply_ops(&mut d, &[op]).unwrap();
        assert_eq!(d, doc! { "labels": ["green"] });
    }

    #[test]
    fn push_creates_array_and_appends() {
        let mut d = doc! {};
        apply_ops(
            &mut d,
            &[UpdateOp::Push {
                path: Path::parse("tags"),
                values: vec![Bson::String("a".into()), Bson::String("b".into())],
            }],
        )
        .unwrap();
        assert_eq!(d, doc! { "tags": ["a", "b"] });
    }

    #[test]
    fn pull_removes_all_equal_elements() {
        let mut d = doc! { "n": [1, 2, 1, 3, 1] };
        apply_ops(
            &mut d,
            &[UpdateOp::Pull {
                path: Path::parse("n"),
                values: vec![Bson::Int32(1)],
            }],
        )
        .unwrap();
        assert_eq!(d, doc! { "n": [2, 3] });
    }

    #[test]
    fn pull_matches_across_numeric_types() {
        let mut d = doc! { "n": [1_i64, 2_i32] };
        apply_ops(
            &mut d,
            &[UpdateOp::Pull {
                path: Path::parse("n"),
                values: vec![Bson::Int32(1)],
            }],
        )
        .unwrap();
        assert_eq!(d, doc! { "n": [2] });
    }

    #[test]
    fn wildcard_update_path_errors() {
        let mut d = doc! { "a": { "b": 1 } };
        let err = apply_ops(&mut d, &[set("a.*", Bson::Int32(1))]).unwrap_err();
        assert!(matches!(err, ApplyError::InvalidTarget(_)));
    }

    #[test]
    fn merge_patch_follows_rfc_semantics() {
        let mut d = doc! { "a": 1, "b": { "x": 1, "y": 2 }, "c": 3 };
        let patch = doc! { "a": 10, "b": { "y": Bson::Null, "z": 9 }, "c": Bson::Null };
        assert!(merge_patch(&mut d, &patch));
        assert_eq!(d, doc! { "a": 10, "b": { "x": 1, "z": 9 } });
    }

    #[test]
    fn merge_patch_unchanged_is_false() {
        let mut d = doc! { "a": 1 };
        assert!(!merge_patch(&mut d, &doc! { "a": 1 }));
    }
}
