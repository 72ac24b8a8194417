use std::fmt;

#[derive(Debug)]
pub enum StoreError {
    ReadOnly,
    KeyspaceNotFound(String),
    Storage(String),
    Io(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ReadOnly => write!(f, "cannot write in a read-only transaction"),
            StoreError::KeyspaceNotFound(name) => write!(f, "keyspace not found: {name}"),
            StoreError::Storage(msg) => write!(f, "storage error: {msg}"),
            StoreError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}
