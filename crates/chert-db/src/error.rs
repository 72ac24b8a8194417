use std::fmt;

use chert_query::{ApplyError, QueryParseError};
use chert_store::StoreError;

#[derive(Debug)]
pub enum DbError {
    Store(StoreError),
    QueryParse(QueryParseError),
    Apply(ApplyError),
    InvalidCollectionMeta(String),
    InvalidIndexMeta(String),
    InvalidIndexMode(String),
    MismatchedIndexUniqueness { collection: String, path: String },
    UniqueIndexViolation { collection: String, path: String },
    InvalidCollectionName(String),
    CollectionNotFound(String),
    TargetCollectionExists(String),
    PatchNotAnObject,
    InvalidDocumentId(String),
    Bson(bson::error::Error),
    Corrupted(String),
    Io(std::io::Error),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Store(e) => write!(f, "store error: {e}"),
            DbError::QueryParse(e) => write!(f, "{e}"),
            DbError::Apply(e) => write!(f, "{e}"),
            DbError::InvalidCollectionMeta(msg) => {
                write!(f, "invalid collection metadata: {msg}")
            }
            DbError::InvalidIndexMeta(msg) => write!(f, "invalid index metadata: {msg}"),
            DbError::InvalidIndexMode(msg) => write!(f, "invalid index mode: {msg}"),
            DbError::MismatchedIndexUniqueness { collection, path } => write!(
                f,
                "index on {collection}.{path} already exists with different uniqueness"
            ),
            DbError::UniqueIndexViolation { collection, path } => {
                write!(f, "unique index violation on {collection}.{path}")
            }
            DbError::InvalidCollectionName(name) => {
                write!(f, "invalid collection name: {name:?}")
            }
            DbError::CollectionNotFound(name) => write!(f, "collection not found: {name}"),
            DbError::TargetCollectionExists(name) => {
                write!(f, "target collection already exists: {name}")
            }
            DbError::PatchNotAnObject => write!(f, "patch document must be an object"),
            DbError::InvalidDocumentId(msg) => write!(f, "invalid document id: {msg}"),
            DbError::Bson(e) => write!(f, "bson error: {e}"),
            DbError::Corrupted(msg) => write!(f, "corrupted data: {msg}"),
            DbError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<StoreError> for DbError {
    fn from(e: StoreError) -> Self {
        DbError::Store(e)
    }
}

impl From<QueryParseError> for DbError {
    fn from(e: QueryParseError) -> Self {
        DbError::QueryParse(e)
    }
}

impl From<ApplyError> for DbError {
    fn from(e: ApplyError) -> Self {
        DbError::Apply(e)
    }
}

impl From<bson::error::Error> for DbError {
    fn from(e: bson::error::Error) -> Self {
        DbError::Bson(e)
    }
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e)
    }
}
