use bson::{Bson, Document};

use crate::filter::{FilterLeaf, FilterOp, FilterTree, Join};
use crate::value::{cmp_values, fold_case, tokenize, values_equal};

/// Per-evaluation state: records the array index matched by the last
/// successful `$elemMatch`, for positional projection.
#[derive(Debug, Default)]
pub struct MatchCtx {
    pub elem_index: Option<usize>,
}

/// Evaluate a filter tree against one document.
///
/// Conjunctions short-circuit on the first miss, disjunctions on the
/// first hit. Leaves flagged `prematched` by the planner are taken as
/// true without touching the document.
pub fn matches(tree: &FilterTree, doc: &Document, ctx: &mut MatchCtx) -> bool {
    match tree {
        FilterTree::Leaf(leaf) => leaf_matches(leaf, doc, ctx),
        FilterTree::Group {
            join,
            negate,
            children,
        } => {
            let result = match join {
                Join::And => children.iter().all(|c| matches(c, doc, ctx)),
                Join::Or => children.iter().any(|c| matches(c, doc, ctx)),
            };
            result != *negate
        }
    }
}

fn leaf_matches(leaf: &FilterLeaf, doc: &Document, ctx: &mut MatchCtx) -> bool {
    if leaf.prematched.get() {
        return true;
    }

    let result = match &leaf.op {
        FilterOp::Exists(expected) => leaf.path.resolve_first(doc).is_some() == *expected,
        // Negated membership is vacuously true on a missing field and
        // fails as soon as any resolved value (or array element) is in
        // the set — so it is the exact complement of $in.
        FilterOp::NotIn(set) => {
            let values = leaf.path.resolve_all(doc);
            !values.iter().any(|v| value_in_set(v, set))
        }
        op => {
            let values = leaf.path.resolve_all(doc);
            values.iter().any(|v| value_matches(op, v, ctx))
        }
    };
    result != leaf.negate
}

/// Set membership with element-wise array expansion.
fn value_in_set(value: &Bson, set: &[Bson]) -> bool {
    if set.iter().any(|rhs| values_equal(value, rhs)) {
        return true;
    }
    match value {
        Bson::Array(arr) => arr
            .iter()
            .any(|e| set.iter().any(|rhs| values_equal(e, rhs))),
        _ => false,
    }
}

/// Test one resolved value against an operator.
///
/// An array value is expanded element-wise for scalar operators, so
/// `{tags: "red"}` matches `tags: ["red", "blue"]` — except where the
/// operator itself consumes the array (`$ni`, `$elemMatch`).
fn value_matches(op: &FilterOp, value: &Bson, ctx: &mut MatchCtx) -> bool {
    match op {
        FilterOp::Contains(rhs) => match value {
            Bson::Array(arr) => arr.iter().any(|e| values_equal(e, rhs)),
            _ => false,
        },
        FilterOp::ElemMatch(sub) => match value {
            Bson::Array(arr) => {
                for (i, elem) in arr.iter().enumerate() {
                    if let Bson::Document(elem_doc) = elem {
                        let mut inner = MatchCtx::default();
                        if matches(sub, elem_doc, &mut inner) {
                            ctx.elem_index = Some(i);
                            return true;
                        }
                    }
                }
                false
            }
            _ => false,
        },
        scalar_op => match value {
            Bson::Array(arr) => {
                // Whole-array matching only makes sense for equality;
                // ordering an array against a scalar is meaningless.
                let whole = matches!(scalar_op, FilterOp::Eq(_) | FilterOp::In(_))
                    && scalar_matches(scalar_op, value);
                whole || arr.iter().any(|e| scalar_matches(scalar_op, e))
            }
            _ => scalar_matches(scalar_op, value),
        },
    }
}

fn scalar_matches(op: &FilterOp, value: &Bson) -> bool {
    match op {
        FilterOp::Eq(rhs) => values_equal(value, rhs),
        FilterOp::In(set) => set.iter().any(|rhs| values_equal(value, rhs)),
        FilterOp::Gt(rhs) => cmp_values(value, rhs) == std::cmp::Ordering::Greater,
        FilterOp::Gte(rhs) => cmp_values(value, rhs) != std::cmp::Ordering::Less,
        FilterOp::Lt(rhs) => cmp_values(value, rhs) == std::cmp::Ordering::Less,
        FilterOp::Lte(rhs) => cmp_values(value, rhs) != std::cmp::Ordering::Greater,
        FilterOp::Between(low, high) => {
            cmp_values(value, low) != std::cmp::Ordering::Less
                && cmp_values(value, high) != std::cmp::Ordering::Greater
        }
        FilterOp::Prefix(prefixes) => match value {
            Bson::String(s) => prefixes.iter().any(|p| s.starts_with(p.as_str())),
            _ => false,
        },
        FilterOp::IcaseEq(rhs) => icase_equal(value, rhs),
        FilterOp::IcaseIn(set) => set.iter().any(|rhs| icase_equal(value, rhs)),
        FilterOp::TokensAll(tokens) => match value {
            Bson::String(s) => {
                let have: Vec<&str> = tokenize(s).collect();
                tokens.iter().all(|t| have.contains(&t.as_str()))
            }
            _ => false,
        },
        FilterOp::TokensAny(tokens) => match value {
            Bson::String(s) => tokenize(s).any(|have| tokens.iter().any(|t| t == have)),
            _ => false,
        },
        FilterOp::Regex(re) => match value {
            Bson::String(s) => re.is_match(s),
            _ => false,
        },
        // Handled one level up.
        FilterOp::Contains(_)
        | FilterOp::ElemMatch(_)
        | FilterOp::Exists(_)
        | FilterOp::NotIn(_) => false,
    }
}

fn icase_equal(value: &Bson, rhs: &Bson) -> bool {
    match (value, rhs) {
        (Bson::String(a), Bson::String(b)) => fold_case(a) == fold_case(b),
        _ => values_equal(value, rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOp;
    use crate::path::Path;
    use bson::doc;

    fn leaf(path: &str, op: FilterOp) -> FilterTree {
        FilterTree::Leaf(FilterLeaf::new(Path::parse(path), op))
    }

    fn check(tree: &FilterTree, doc: &Document) -> bool {
        matches(tree, doc, &mut MatchCtx::default())
    }

    #[test]
    fn eq_on_scalar_and_array_field() {
        let d = doc! { "name": "Anton", "tags": ["red", "blue"] };
        assert!(check(
            &leaf("name", FilterOp::Eq(Bson::String("Anton".into()))),
            &d
        ));
        assert!(check(
            &leaf("tags", FilterOp::Eq(Bson::String("blue".into()))),
            &d
        ));
        assert!(!check(
            &leaf("tags", FilterOp::Eq(Bson::String("green".into()))),
            &d
        ));
    }

    #[test]
    fn missing_path_is_no_match_not_error() {
        let d = doc! { "a": 1 };
        assert!(!check(&leaf("b", FilterOp::Eq(Bson::Int32(1))), &d));
    }

    #[test]
    fn in_empty_matches_nothing_nin_empty_everything() {
        let d = doc! { "a": 1 };
        assert!(!check(&leaf("a", FilterOp::In(vec![])), &d));
        assert!(check(&leaf("a", FilterOp::NotIn(vec![])), &d));
        // $nin over a missing field is vacuously true.
        assert!(!check(&leaf("missing", FilterOp::In(vec![])), &d));
        assert!(check(
            &leaf("missing", FilterOp::NotIn(vec![Bson::Int32(1)])),
            &d
        ));
        // Any matching array element fails the whole $nin.
        let arr_doc = doc! { "t": [1, 2] };
        assert!(!check(
            &leaf("t", FilterOp::NotIn(vec![Bson::Int32(2)])),
            &arr_doc
        ));
    }

    #[test]
    fn range_operators_with_numeric_widening() {
        let d = doc! { "score": 7_i64 };
        assert!(check(&leaf("score", FilterOp::Gt(Bson::Double(6.5))), &d));
        assert!(check(&leaf("score", FilterOp::Lte(Bson::Int32(7))), &d));
        assert!(!check(&leaf("score", FilterOp::Lt(Bson::Int32(7))), &d));
    }

    #[test]
    fn ordering_an_array_field_compares_elements_only() {
        let d = doc! { "n": [1, 2] };
        assert!(!check(&leaf("n", FilterOp::Gt(Bson::Int32(5))), &d));
        assert!(check(&leaf("n", FilterOp::Gt(Bson::Int32(1))), &d));
        // Exact-array equality still works.
        let arr = Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)]);
        assert!(check(&leaf("n", FilterOp::Eq(arr)), &d));
    }

    #[test]
    fn between_is_inclusive() {
        let d = doc! { "x": 0.93 };
        assert!(check(
            &leaf(
                "x",
                FilterOp::Between(Bson::Double(0.33), Bson::Double(0.95))
            ),
            &d
        ));
        let edge = doc! { "x": 0.95 };
        assert!(check(
            &leaf(
                "x",
                FilterOp::Between(Bson::Double(0.33), Bson::Double(0.95))
            ),
            &edge
        ));
    }

    #[test]
    fn prefix_any_of() {
        let d = doc! { "name": "Antonov" };
        assert!(check(
            &leaf("name", FilterOp::Prefix(vec!["Ant".into(), "Xyz".into()])),
            &d
        ));
        assert!(!check(&leaf("name", FilterOp::Prefix(vec!["xyz".into()])), &d));
    }

    #[test]
    fn icase_folds_both_sides() {
        let d = doc! { "city": "NOVOSIBIRSK" };
        assert!(check(
            &leaf("city", FilterOp::IcaseEq(Bson::String("novosibirsk".into()))),
            &d
        ));
        assert!(check(
            &leaf(
                "city",
                FilterOp::IcaseIn(vec![
                    Bson::String("moscow".into()),
                    Bson::String("Novosibirsk".into())
                ])
            ),
            &d
        ));
    }

    #[test]
    fn token_operators() {
        let d = doc! { "line": "quick brown fox, lazy dog" };
        assert!(check(
            &leaf(
                "line",
                FilterOp::TokensAll(vec!["fox".into(), "dog".into()])
            ),
            &d
        ));
        assert!(!check(
            &leaf(
                "line",
                FilterOp::TokensAll(vec!["fox".into(), "cat".into()])
            ),
            &d
        ));
        assert!(check(
            &leaf(
                "line",
                FilterOp::TokensAny(vec!["cat".into(), "dog".into()])
            ),
            &d
        ));
    }

    #[test]
    fn contains_requires_array_field() {
        let d = doc! { "tags": ["a", "b"], "name": "a" };
        assert!(check(
            &leaf("tags", FilterOp::Contains(Bson::String("a".into()))),
            &d
        ));
        assert!(!check(
            &leaf("name", FilterOp::Contains(Bson::String("a".into()))),
            &d
        ));
    }

    #[test]
    fn exists_checks_presence_only() {
        let d = doc! { "a": Bson::Null };
        assert!(check(&leaf("a", FilterOp::Exists(true)), &d));
        assert!(check(&leaf("b", FilterOp::Exists(false)), &d));
        assert!(!check(&leaf("a", FilterOp::Exists(false)), &d));
    }

    #[test]
    fn elem_match_reports_index() {
        let d = doc! { "arr": [ { "k": "t", "v": "a" }, { "k": "t", "v": "b" } ] };
        let sub = FilterTree::and(vec![
            leaf("k", FilterOp::Eq(Bson::String("t".into()))),
            leaf("v", FilterOp::Eq(Bson::String("b".into()))),
        ]);
        let tree = leaf("arr", FilterOp::ElemMatch(Box::new(sub)));
        let mut ctx = MatchCtx::default();
        assert!(matches(&tree, &d, &mut ctx));
        assert_eq!(ctx.elem_index, Some(1));

        let sub_miss = FilterTree::and(vec![
            leaf("k", FilterOp::Eq(Bson::String("t".into()))),
            leaf("v", FilterOp::Eq(Bson::String("c".into()))),
        ]);
        let tree_miss = leaf("arr", FilterOp::ElemMatch(Box::new(sub_miss)));
        assert!(!check(&tree_miss, &d));
    }

    #[test]
    fn group_negation_and_double_negation() {
        let d = doc! { "a": 1 };
        let inner = leaf("a", FilterOp::Eq(Bson::Int32(1)));
        let negated = FilterTree::and(vec![inner.clone()]).negated();
        assert!(!check(&negated, &d));
        let double = negated.negated();
        assert!(check(&double, &d));
    }

    #[test]
    fn nested_not_over_exists_false() {
        // $not { $not { $exists: false } } == $exists: false
        let d = doc! { "a": 1 };
        let tree = FilterTree::and(vec![leaf("b", FilterOp::Exists(false))])
            .negated()
            .negated();
        assert!(check(&tree, &d));
        let tree2 = FilterTree::and(vec![leaf("a", FilterOp::Exists(false))])
            .negated()
            .negated();
        assert!(!check(&tree2, &d));
    }

    #[test]
    fn prematched_leaf_skips_evaluation() {
        let d = doc! { "a": 1 };
        let l = FilterLeaf::new(Path::parse("a"), FilterOp::Eq(Bson::Int32(999)));
        l.prematched.set(true);
        assert!(check(&FilterTree::Leaf(l), &d));
    }

    #[test]
    fn or_short_circuits() {
        let d = doc! { "a": 1, "b": 2 };
        let tree = FilterTree::or(vec![
            leaf("a", FilterOp::Eq(Bson::Int32(1))),
            leaf("b", FilterOp::Eq(Bson::Int32(999))),
        ]);
        assert!(check(&tree, &d));
    }

    #[test]
    fn wildcard_path_in_filter() {
        let d = doc! { "books": [ { "title": "Dune" }, { "title": "Hyperion" } ] };
        let tree = leaf("books.*.title", FilterOp::Eq(Bson::String("Hyperion".into())));
        assert!(check(&tree, &d));
    }
}
