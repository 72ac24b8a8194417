use std::cell::Cell;

use bson::Bson;
use regex::Regex;

use crate::path::Path;

/// Operator of a single filter leaf, with its right-hand argument.
#[derive(Debug, Clone)]
pub enum FilterOp {
    /// Scalar equality (implicit for bare values).
    Eq(Bson),
    /// Membership in a scalar set.
    In(Vec<Bson>),
    /// Negated membership. Empty set matches everything.
    NotIn(Vec<Bson>),
    /// `$ni` — the array-typed field contains the scalar rhs.
    Contains(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    /// `$bt` — inclusive range, normalised to `low <= x <= high`.
    Between(Bson, Bson),
    /// `$begin` — string starts with any of the given prefixes.
    Prefix(Vec<String>),
    /// `$icase` equality after case folding.
    IcaseEq(Bson),
    /// `$icase` + `$in` after case folding.
    IcaseIn(Vec<Bson>),
    /// `$strand` — all tokens present in the tokenised field value.
    TokensAll(Vec<String>),
    /// `$stror` — any token present.
    TokensAny(Vec<String>),
    Exists(bool),
    /// `$elemMatch` — one array element satisfies the sub-filter.
    ElemMatch(Box<FilterTree>),
    Regex(Regex),
}

/// One leaf predicate: path, operator, negation.
#[derive(Debug, Clone)]
pub struct FilterLeaf {
    pub path: Path,
    pub op: FilterOp,
    pub negate: bool,
    /// Set by the planner when the chosen index scan already guarantees
    /// this predicate; the residual evaluator then skips it.
    pub prematched: Cell<bool>,
}

impl FilterLeaf {
    pub fn new(path: Path, op: FilterOp) -> Self {
        Self {
            path,
            op,
            negate: false,
            prematched: Cell::new(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    And,
    Or,
}

/// Boolean combination of filter leaves.
#[derive(Debug, Clone)]
pub enum FilterTree {
    Leaf(FilterLeaf),
    Group {
        join: Join,
        negate: bool,
        children: Vec<FilterTree>,
    },
}

impl FilterTree {
    pub fn and(children: Vec<FilterTree>) -> Self {
        FilterTree::Group {
            join: Join::And,
            negate: false,
            children,
        }
    }

    pub fn or(children: Vec<FilterTree>) -> Self {
        FilterTree::Group {
            join: Join::Or,
            negate: false,
            children,
        }
    }

    pub fn negated(self) -> Self {
        match self {
            FilterTree::Leaf(mut leaf) => {
                leaf.negate = !leaf.negate;
                FilterTree::Leaf(leaf)
            }
            FilterTree::Group {
                join,
                negate,
                children,
            } => FilterTree::Group {
                join,
                negate: !negate,
                children,
            },
        }
    }

    /// Count leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            FilterTree::Leaf(_) => 1,
            FilterTree::Group { children, .. } => children.iter().map(|c| c.leaf_count()).sum(),
        }
    }

    /// Count `$or` groups in the tree.
    pub fn or_count(&self) -> usize {
        match self {
            FilterTree::Leaf(_) => 0,
            FilterTree::Group { join, children, .. } => {
                let own = usize::from(*join == Join::Or);
                own + children.iter().map(|c| c.or_count()).sum::<usize>()
            }
        }
    }
}
