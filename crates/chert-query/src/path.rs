use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

/// One segment of a compiled dotted path.
///
/// A `Key` segment resolves to a document field, or — when its text is a
/// decimal literal — to an array element at that position. `Any` matches
/// every child at one level; `Deep` matches zero or more levels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Key(String),
    Any,
    Deep,
}

/// A compiled dotted field selector, e.g. `address.city` or `tags.*.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    raw: String,
    segments: Vec<Segment>,
}

impl Path {
    pub fn parse(s: &str) -> Self {
        let segments = s
            .split('.')
            .map(|seg| match seg {
                "*" => Segment::Any,
                "**" => Segment::Deep,
                other => Segment::Key(other.to_string()),
            })
            .collect();
        Self {
            raw: s.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn has_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Any | Segment::Deep))
    }

    /// Resolve the first value at this path, if any.
    pub fn resolve_first<'a>(&self, doc: &'a Document) -> Option<&'a Bson> {
        let mut first = None;
        resolve_doc(&self.segments, doc, &mut |v| {
            if first.is_none() {
                first = Some(v);
                false // stop
            } else {
                false
            }
        });
        first
    }

    /// Resolve every value at this path (wildcards may yield many).
    pub fn resolve_all<'a>(&self, doc: &'a Document) -> Vec<&'a Bson> {
        let mut out = Vec::new();
        resolve_doc(&self.segments, doc, &mut |v| {
            out.push(v);
            true
        });
        out
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Walk `segments` from a document root. The visitor returns `false` to
/// stop the walk — first-match resolution stays lazy this way.
fn resolve_doc<'a>(
    segments: &[Segment],
    doc: &'a Document,
    visit: &mut impl FnMut(&'a Bson) -> bool,
) -> bool {
    match segments.split_first() {
        None => true,
        Some((Segment::Key(k), rest)) => match doc.get(k) {
            Some(v) => resolve_value(rest, v, visit),
            None => true,
        },
        Some((Segment::Any, rest)) => {
            for (_, v) in doc.iter() {
                if !resolve_value(rest, v, visit) {
                    return false;
                }
            }
            true
        }
        Some((Segment::Deep, rest)) => {
            // Zero levels: the remaining path applies here.
            if !resolve_doc(rest, doc, visit) {
                return false;
            }
            // One or more levels: keep Deep active below every child.
            for (_, v) in doc.iter() {
                if !resolve_value(segments, v, visit) {
                    return false;
                }
            }
            true
        }
    }
}

fn resolve_value<'a>(
    segments: &[Segment],
    node: &'a Bson,
    visit: &mut impl FnMut(&'a Bson) -> bool,
) -> bool {
    match segments.split_first() {
        None => visit(node),
        Some((Segment::Key(k), rest)) => match node {
            Bson::Document(doc) => match doc.get(k) {
                Some(v) => resolve_value(rest, v, visit),
                None => true,
            },
            Bson::Array(arr) => match k.parse::<usize>() {
                Ok(idx) => match arr.get(idx) {
                    Some(v) => resolve_value(rest, v, visit),
                    None => true,
                },
                Err(_) => true,
            },
            _ => true,
        },
        Some((Segment::Any, rest)) => match node {
            Bson::Document(doc) => {
                for (_, v) in doc.iter() {
                    if !resolve_value(rest, v, visit) {
                        return false;
                    }
                }
                true
            }
            Bson::Array(arr) => {
                for v in arr {
                    if !resolve_value(rest, v, visit) {
                        return false;
                    }
                }
                true
            }
            _ => true,
        },
        Some((Segment::Deep, rest)) => {
            if !resolve_value(rest, node, visit) {
                return false;
            }
            match node {
                Bson::Document(doc) => {
                    for (_, v) in doc.iter() {
                        if !resolve_value(segments, v, visit) {
                            return false;
                        }
                    }
                    true
                }
                Bson::Array(arr) => {
                    for v in arr {
                        if !resolve_value(segments, v, visit) {
                            return false;
                        }
                    }
                    true
                }
                _ => true,
            }
        }
    }
}
