use bson::Document;
use serde::{Deserialize, Serialize};

use crate::apply::ApplySpec;
use crate::filter::FilterTree;
use crate::path::Path;

/// One `$orderby` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderKey {
    pub path: Path,
    pub descending: bool,
}

/// `$fields` projection: either an include list or an exclude list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldsSpec {
    pub include: bool,
    pub paths: Vec<Path>,
}

/// `$do.<field>.$join` — replace the id(s) at `path` with documents
/// fetched from `collection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinClause {
    pub path: Path,
    pub collection: String,
}

/// `$do.<field>.$slice` — slice the array at `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceClause {
    pub path: Path,
    pub skip: u64,
    pub limit: u64,
}

/// A parsed query document: filter tree plus the lifted apply, projection
/// and hint clauses.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub filter: Option<FilterTree>,
    pub apply: ApplySpec,
    pub fields: Option<FieldsSpec>,
    pub joins: Vec<JoinClause>,
    pub slices: Vec<SliceClause>,
    pub order: Vec<OrderKey>,
    pub skip: u64,
    pub max: Option<u64>,
}

impl QuerySpec {
    /// True when executing the query writes documents: any update
    /// operator, `$upsert`, or `$dropall`. Decides the lock mode.
    pub fn has_mutation(&self) -> bool {
        !self.apply.ops.is_empty() || self.apply.upsert.is_some() || self.apply.dropall
    }

    /// The `$upsert` template, if any.
    pub fn upsert_doc(&self) -> Option<&Document> {
        self.apply.upsert.as_ref()
    }
}
