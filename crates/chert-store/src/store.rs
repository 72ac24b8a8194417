use std::borrow::Cow;

use crate::error::StoreError;

/// One `(key, value)` pair yielded by a scan.
pub type ScanItem<'c> = Result<(Cow<'c, [u8]>, Cow<'c, [u8]>), StoreError>;

/// Boxed scan iterator borrowing from the transaction's snapshot.
pub type ScanIter<'c> = Box<dyn Iterator<Item = ScanItem<'c>> + 'c>;

/// An ordered key/value store organised into named keyspaces.
///
/// A keyspace is an independent ordered map from byte keys to byte values.
/// Transactions see a consistent snapshot; at most one write transaction
/// exists at a time and its mutations become visible atomically on commit.
pub trait Store {
    type Txn<'a>: Transaction
    where
        Self: 'a;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError>;

    fn create_keyspace(&self, name: &str) -> Result<(), StoreError>;
    fn drop_keyspace(&self, name: &str) -> Result<(), StoreError>;
    fn rename_keyspace(&self, old: &str, new: &str) -> Result<(), StoreError>;
    fn list_keyspaces(&self) -> Result<Vec<String>, StoreError>;
}

/// Shared handles open the same store: a database can be closed and
/// reopened over an `Arc` without moving the backing maps.
impl<S: Store> Store for std::sync::Arc<S> {
    type Txn<'a>
        = S::Txn<'a>
    where
        Self: 'a;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError> {
        (**self).begin(read_only)
    }

    fn create_keyspace(&self, name: &str) -> Result<(), StoreError> {
        (**self).create_keyspace(name)
    }

    fn drop_keyspace(&self, name: &str) -> Result<(), StoreError> {
        (**self).drop_keyspace(name)
    }

    fn rename_keyspace(&self, old: &str, new: &str) -> Result<(), StoreError> {
        (**self).rename_keyspace(old, new)
    }

    fn list_keyspaces(&self) -> Result<Vec<String>, StoreError> {
        (**self).list_keyspaces()
    }
}

/// A snapshot-isolated transaction over a [`Store`].
///
/// Scan iterators yield keys in lexicographic byte order (or reverse).
/// Returned slices stay valid until the keyspace handle is dropped —
/// the snapshot owns the data, not the cursor position.
pub trait Transaction {
    /// Pre-resolved keyspace handle, cheap to clone.
    type Ks: Clone;

    fn keyspace(&self, name: &str) -> Result<Self::Ks, StoreError>;

    fn get<'c>(&self, ks: &'c Self::Ks, key: &[u8]) -> Result<Option<Cow<'c, [u8]>>, StoreError>;

    /// Ascending scan over all keys starting with `prefix`.
    fn scan_prefix<'c>(&'c self, ks: &'c Self::Ks, prefix: &[u8])
        -> Result<ScanIter<'c>, StoreError>;

    /// Descending scan over all keys starting with `prefix`.
    fn scan_prefix_rev<'c>(
        &'c self,
        ks: &'c Self::Ks,
        prefix: &[u8],
    ) -> Result<ScanIter<'c>, StoreError>;

    /// Ascending scan from the first key `>= start`, bounded to `prefix`.
    fn scan_from<'c>(
        &'c self,
        ks: &'c Self::Ks,
        prefix: &[u8],
        start: &[u8],
    ) -> Result<ScanIter<'c>, StoreError>;

    /// Descending scan from the last key `<= end`, bounded to `prefix`.
    fn scan_from_rev<'c>(
        &'c self,
        ks: &'c Self::Ks,
        prefix: &[u8],
        end: &[u8],
    ) -> Result<ScanIter<'c>, StoreError>;

    fn put(&self, ks: &Self::Ks, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, ks: &Self::Ks, key: &[u8]) -> Result<(), StoreError>;

    fn create_keyspace(&mut self, name: &str) -> Result<(), StoreError>;
    fn drop_keyspace(&mut self, name: &str) -> Result<(), StoreError>;

    fn commit(self) -> Result<(), StoreError>;
    fn rollback(self) -> Result<(), StoreError>;
}
