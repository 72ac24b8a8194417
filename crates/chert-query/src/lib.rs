mod apply;
mod eval;
mod filter;
mod parse;
mod path;
mod query;
pub mod value;

pub use apply::{ApplyError, ApplySpec, UpdateOp, apply_ops, merge_patch};
pub use eval::{MatchCtx, matches};
pub use filter::{FilterLeaf, FilterOp, FilterTree, Join};
pub use parse::{QueryParseError, parse_query};
pub use path::{Path, Segment};
pub use query::{FieldsSpec, JoinClause, OrderKey, QuerySpec, SliceClause};
