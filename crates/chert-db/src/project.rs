//! Result projection: `$fields` pruning, `$do … $join` substitution and
//! `$do … $slice` array slicing.

use bson::{Bson, Document};
use chert_query::{FieldsSpec, JoinClause, QuerySpec, Segment, SliceClause};
use chert_store::Transaction;

use crate::error::DbError;
use crate::join::JoinResolver;
use crate::planner::PK_FIELD;

/// Produce the projected form of a matched document.
pub(crate) fn project<T: Transaction>(
    txn: &T,
    spec: &QuerySpec,
    joins: &mut JoinResolver,
    mut doc: Document,
) -> Result<Document, DbError> {
    for clause in &spec.joins {
        apply_join(txn, joins, clause, &mut doc)?;
    }
    for clause in &spec.slices {
        apply_slice(clause, &mut doc);
    }
    if let Some(fields) = &spec.fields {
        apply_fields(&mut doc, fields);
    }
    Ok(doc)
}

/// Mutable walk to the value at a plain dotted path.
fn navigate<'a>(doc: &'a mut Document, segments: &[Segment]) -> Option<&'a mut Bson> {
    let (first, rest) = segments.split_first()?;
    let Segment::Key(key) = first else {
        return None;
    };
    let mut node = doc.get_mut(key)?;
    for seg in rest {
        let Segment::Key(key) = seg else {
            return None;
        };
        node = match node {
            Bson::Document(sub) => sub.get_mut(key)?,
            Bson::Array(arr) => {
                let idx = key.parse::<usize>().ok()?;
                arr.get_mut(idx)?
            }
            _ => return None,
        };
    }
    Some(node)
}

fn apply_join<T: Transaction>(
    txn: &T,
    joins: &mut JoinResolver,
    clause: &JoinClause,
    doc: &mut Document,
) -> Result<(), DbError> {
    let Some(target) = navigate(doc, clause.path.segments()) else {
        return Ok(());
    };
    match target {
        Bson::Array(arr) => {
            for elem in arr.iter_mut() {
                if let Some(joined) = joins.resolve(txn, &clause.collection, elem)? {
                    *elem = Bson::Document(joined);
                }
            }
        }
        other => {
            if let Some(joined) = joins.resolve(txn, &clause.collection, other)? {
                *other = Bson::Document(joined);
            }
        }
    }
    Ok(())
}

fn apply_slice(clause: &SliceClause, doc: &mut Document) {
    let Some(Bson::Array(arr)) = navigate(doc, clause.path.segments()) else {
        return;
    };
    let skip = (clause.skip as usize).min(arr.len());
    let end = skip.saturating_add(clause.limit as usize).min(arr.len());
    *arr = arr[skip..end].to_vec();
}

fn apply_fields(doc: &mut Document, fields: &FieldsSpec) {
    let paths: Vec<&[Segment]> = fields.paths.iter().map(|p| p.segments()).collect();
    if fields.include {
        let mut pruned = Document::new();
        include_into(doc, &paths, &mut pruned);
        // The id is part of every projection.
        if let Some(id) = doc.get(PK_FIELD) {
            let id = id.clone();
            pruned.insert(PK_FIELD, id);
        }
        *doc = pruned;
    } else {
        for path in paths {
            exclude_path(doc, path);
        }
    }
}

fn segment_matches(seg: &Segment, key: &str) -> bool {
    match seg {
        Segment::Key(k) => k == key,
        Segment::Any => true,
        Segment::Deep => false,
    }
}

fn include_into(src: &Document, paths: &[&[Segment]], out: &mut Document) {
    for (key, value) in src.iter() {
        if key == PK_FIELD {
            continue;
        }
        let mut keep_whole = false;
        let mut suffixes: Vec<&[Segment]> = Vec::new();
        for path in paths {
            let Some((head, rest)) = path.split_first() else {
                continue;
            };
            if !segment_matches(head, key) {
                continue;
            }
            if rest.is_empty() {
                keep_whole = true;
            } else {
                suffixes.push(rest);
            }
        }
        if keep_whole {
            out.insert(key.clone(), value.clone());
        } else if !suffixes.is_empty() {
            match value {
                Bson::Document(sub) => {
                    let mut pruned = Document::new();
                    include_into(sub, &suffixes, &mut pruned);
                    if !pruned.is_empty() {
                        out.insert(key.clone(), Bson::Document(pruned));
                    }
                }
                Bson::Array(arr) => {
                    let mut pruned_elems = Vec::new();
                    for elem in arr {
                        if let Bson::Document(sub) = elem {
                            let mut pruned = Document::new();
                            include_into(sub, &suffixes, &mut pruned);
                            if !pruned.is_empty() {
                                pruned_elems.push(Bson::Document(pruned));
                            }
                        }
                    }
                    if !pruned_elems.is_empty() {
                        out.insert(key.clone(), Bson::Array(pruned_elems));
                    }
                }
                _ => {}
            }
        }
    }
}

fn exclude_path(doc: &mut Document, path: &[Segment]) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        match head {
            Segment::Key(k) if k != PK_FIELD => {
                doc.remove(k);
            }
            Segment::Any => {
                let keys: Vec<String> = doc
                    .keys()
                    .filter(|k| k.as_str() != PK_FIELD)
                    .cloned()
                    .collect();
                for k in keys {
                    doc.remove(&k);
                }
            }
            _ => {}
        }
        return;
    }
    let keys: Vec<String> = doc
        .keys()
        .filter(|k| segment_matches(head, k))
        .cloned()
        .collect();
    for key in keys {
        match doc.get_mut(&key) {
            Some(Bson::Document(sub)) => exclude_path(sub, rest),
            Some(Bson::Array(arr)) => {
                for elem in arr.iter_mut() {
                    if let Bson::Document(sub) = elem {
                        exclude_path(sub, rest);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use chert_query::{FieldsSpec, Path};

    fn fields(include: bool, paths: &[&str]) -> FieldsSpec {
        FieldsSpec {
            include,
            paths: paths.iter().map(|p| Path::parse(p)).collect(),
        }
    }

    #[test]
    fn include_keeps_listed_and_id() {
        let mut d = doc! { "_id": 1_i64, "a": 1, "b": { "x": 2, "y": 3 }, "c": 4 };
        apply_fields(&mut d, &fields(true, &["a", "b.x"]));
        assert_eq!(d, doc! { "a": 1, "b": { "x": 2 }, "_id": 1_i64 });
    }

    #[test]
    fn exclude_removes_listed_only() {
        let mut d = doc! { "_id": 1_i64, "a": 1, "b": { "x": 2, "y": 3 } };
        apply_fields(&mut d, &fields(false, &["b.y", "a"]));
        assert_eq!(d, doc! { "_id": 1_i64, "b": { "x": 2 } });
    }

    #[test]
    fn include_descends_into_array_elements() {
        let mut d = doc! { "items": [ { "k": 1, "v": 2 }, { "k": 3, "v": 4 } ] };
        apply_fields(&mut d, &fields(true, &["items.k"]));
        assert_eq!(d, doc! { "items": [ { "k": 1 }, { "k": 3 } ] });
    }

    #[test]
    fn slice_windows_the_array() {
        let mut d = doc! { "arr": [0, 1, 2, 3, 4] };
        apply_slice(
            &SliceClause {
                path: Path::parse("arr"),
                skip: 1,
                limit: 2,
            },
            &mut d,
        );
        assert_eq!(d, doc! { "arr": [1, 2] });
    }

    #[test]
    fn slice_past_end_yields_empty() {
        let mut d = doc! { "arr": [0, 1] };
        apply_slice(
            &SliceClause {
                path: Path::parse("arr"),
                skip: 5,
                limit: 2,
            },
            &mut d,
        );
        assert_eq!(d, doc! { "arr": [] });
    }

    #[test]
    fn navigate_through_array_index() {
        let mut d = doc! { "a": [ { "b": 1 }, { "b": 2 } ] };
        let v = navigate(&mut d, Path::parse("a.1.b").segments()).unwrap();
        assert_eq!(v, &mut Bson::Int32(2));
    }
}
