use std::borrow::Cow;
use std::cell::RefCell;
use std::ops::Bound;
use std::sync::{Arc, MutexGuard};

use crate::error::StoreError;
use crate::store::{ScanIter, Transaction};

use super::store::{Keyspace, MemoryStore, Root};

/// Keyspace handle: an owned structural-sharing clone of the keyspace
/// as it looked when the handle was fetched. Scan iterators borrow from
/// the handle, so later writes in the same transaction never move a
/// cursor — a fresh `keyspace()` call picks those writes up.
#[derive(Clone)]
pub struct MemoryKs {
    pub(crate) name: String,
    pub(crate) view: Keyspace,
}

enum Mode<'s> {
    /// Pinned root; shared with other readers.
    Read(Arc<Root>),
    /// Private reworked root, published wholesale on commit.
    Write {
        working: RefCell<Root>,
        _gate: MutexGuard<'s, ()>,
    },
}

pub struct MemoryTransaction<'s> {
    store: &'s MemoryStore,
    mode: Mode<'s>,
}

impl<'s> MemoryTransaction<'s> {
    pub(crate) fn reader(store: &'s MemoryStore, root: Arc<Root>) -> Self {
        Self {
            store,
            mode: Mode::Read(root),
        }
    }

    pub(crate) fn writer(store: &'s MemoryStore, working: Root, gate: MutexGuard<'s, ()>) -> Self {
        Self {
            store,
            mode: Mode::Write {
                working: RefCell::new(working),
                _gate: gate,
            },
        }
    }

    fn working(&self) -> Result<&RefCell<Root>, StoreError> {
        match &self.mode {
            Mode::Write { working, .. } => Ok(working),
            Mode::Read(_) => Err(StoreError::ReadOnly),
        }
    }

    /// Edit one keyspace of the working root in place.
    fn rework(
        &self,
        ks: &MemoryKs,
        edit: impl FnOnce(&mut Keyspace),
    ) -> Result<(), StoreError> {
        let working = self.working()?;
        let mut root = working.borrow_mut();
        match root.get_mut(&ks.name) {
            Some(space) => {
                edit(space);
                Ok(())
            }
            None => Err(StoreError::KeyspaceNotFound(ks.name.clone())),
        }
    }
}

/// Smallest byte string greater than every key starting with `prefix`,
/// or `None` when no such bound exists (prefix is all 0xff).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last() {
        if *last == 0xff {
            upper.pop();
        } else {
            *upper.last_mut().expect("non-empty") += 1;
            return Some(upper);
        }
    }
    None
}

/// Exclusive upper bound of a prefix region.
fn region_end(prefix: &[u8]) -> Bound<Vec<u8>> {
    match prefix_successor(prefix) {
        Some(succ) => Bound::Excluded(succ),
        None => Bound::Unbounded,
    }
}

/// `[prefix, successor(prefix))` as range bounds.
fn region(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    (Bound::Included(prefix.to_vec()), region_end(prefix))
}

/// `[max(prefix, start), successor(prefix))` — a seek clamped into the
/// prefix region from below.
fn region_from(prefix: &[u8], start: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let lower = if start < prefix { prefix } else { start };
    (Bound::Included(lower.to_vec()), region_end(prefix))
}

/// `[prefix, min(end, successor(prefix))]` — a seek clamped into the
/// prefix region from above.
fn region_until(prefix: &[u8], end: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let upper = match prefix_successor(prefix) {
        Some(succ) if end >= succ.as_slice() => Bound::Excluded(succ),
        _ => Bound::Included(end.to_vec()),
    };
    (Bound::Included(prefix.to_vec()), upper)
}

type Entry<'c> = (&'c Vec<u8>, &'c Vec<u8>);

fn borrow_entry<'c>(
    (k, v): Entry<'c>,
) -> Result<(Cow<'c, [u8]>, Cow<'c, [u8]>), StoreError> {
    Ok((Cow::Borrowed(k.as_slice()), Cow::Borrowed(v.as_slice())))
}

impl<'s> Transaction for MemoryTransaction<'s> {
    type Ks = MemoryKs;

    fn keyspace(&self, name: &str) -> Result<Self::Ks, StoreError> {
        let view = match &self.mode {
            Mode::Read(root) => root.get(name).cloned(),
            Mode::Write { working, .. } => working.borrow().get(name).cloned(),
        };
        match view {
            Some(view) => Ok(MemoryKs {
                name: name.to_string(),
                view,
            }),
            None => Err(StoreError::KeyspaceNotFound(name.to_string())),
        }
    }

    fn get<'c>(&self, ks: &'c Self::Ks, key: &[u8]) -> Result<Option<Cow<'c, [u8]>>, StoreError> {
        Ok(ks.view.get(key).map(|v| Cow::Borrowed(v.as_slice())))
    }

    fn scan_prefix<'c>(
        &'c self,
        ks: &'c Self::Ks,
        prefix: &[u8],
    ) -> Result<ScanIter<'c>, StoreError> {
        Ok(Box::new(ks.view.range(region(prefix)).map(borrow_entry)))
    }

    fn scan_prefix_rev<'c>(
        &'c self,
        ks: &'c Self::Ks,
        prefix: &[u8],
    ) -> Result<ScanIter<'c>, StoreError> {
        Ok(Box::new(
            ks.view.range(region(prefix)).rev().map(borrow_entry),
        ))
    }

    fn scan_from<'c>(
        &'c self,
        ks: &'c Self::Ks,
        prefix: &[u8],
        start: &[u8],
    ) -> Result<ScanIter<'c>, StoreError> {
        Ok(Box::new(
            ks.view.range(region_from(prefix, start)).map(borrow_entry),
        ))
    }

    fn scan_from_rev<'c>(
        &'c self,
        ks: &'c Self::Ks,
        prefix: &[u8],
        end: &[u8],
    ) -> Result<ScanIter<'c>, StoreError> {
        Ok(Box::new(
            ks.view
                .range(region_until(prefix, end))
                .rev()
                .map(borrow_entry),
        ))
    }

    fn put(&self, ks: &Self::Ks, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.rework(ks, |space| {
            space.insert(key.to_vec(), value.to_vec());
        })
    }

    fn delete(&self, ks: &Self::Ks, key: &[u8]) -> Result<(), StoreError> {
        self.rework(ks, |space| {
            space.remove(key);
        })
    }

    fn create_keyspace(&mut self, name: &str) -> Result<(), StoreError> {
        let working = self.working()?;
        let mut root = working.borrow_mut();
        if !root.contains_key(name) {
            root.insert(name.to_string(), Keyspace::new());
        }
        Ok(())
    }

    fn drop_keyspace(&mut self, name: &str) -> Result<(), StoreError> {
        let working = self.working()?;
        working.borrow_mut().remove(name);
        Ok(())
    }

    fn commit(self) -> Result<(), StoreError> {
        match self.mode {
            Mode::Write { working, _gate } => {
                self.store.publish(working.into_inner());
                Ok(())
            }
            Mode::Read(_) => Err(StoreError::ReadOnly),
        }
    }

    fn rollback(self) -> Result<(), StoreError> {
        // Dropping the working root (and the writer gate) is the whole
        // story; readers have nothing to undo.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn store_with(entries: &[(&[u8], &[u8])]) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_keyspace("t").unwrap();
        let txn = store.begin(false).unwrap();
        let ks = txn.keyspace("t").unwrap();
        for (k, v) in entries {
            txn.put(&ks, k, v).unwrap();
        }
        txn.commit().unwrap();
        store
    }

    #[test]
    fn snapshot_isolation() {
        let store = store_with(&[(b"a", b"1")]);
        let reader = store.begin(true).unwrap();
        let rks = reader.keyspace("t").unwrap();

        let writer = store.begin(false).unwrap();
        let wks = writer.keyspace("t").unwrap();
        writer.put(&wks, b"a", b"2").unwrap();
        writer.commit().unwrap();

        // Reader still sees the pinned root.
        assert_eq!(reader.get(&rks, b"a").unwrap().unwrap().as_ref(), b"1");

        let reader2 = store.begin(true).unwrap();
        let rks2 = reader2.keyspace("t").unwrap();
        assert_eq!(reader2.get(&rks2, b"a").unwrap().unwrap().as_ref(), b"2");
    }

    #[test]
    fn handle_pins_its_view_but_refetch_sees_own_writes() {
        let store = store_with(&[(b"k", b"old")]);
        let txn = store.begin(false).unwrap();
        let before = txn.keyspace("t").unwrap();
        txn.put(&before, b"k", b"new").unwrap();

        // The old handle is a pinned view; a fresh handle observes the
        // transaction's own write.
        assert_eq!(txn.get(&before, b"k").unwrap().unwrap().as_ref(), b"old");
        let after = txn.keyspace("t").unwrap();
        assert_eq!(txn.get(&after, b"k").unwrap().unwrap().as_ref(), b"new");
    }

    #[test]
    fn scan_prefix_is_ordered_and_bounded() {
        let store = store_with(&[(b"a\x001", b""), (b"a\x002", b""), (b"b\x001", b"")]);
        let txn = store.begin(true).unwrap();
        let ks = txn.keyspace("t").unwrap();
        let keys: Vec<Vec<u8>> = txn
            .scan_prefix(&ks, b"a\x00")
            .unwrap()
            .map(|r| r.unwrap().0.into_owned())
            .collect();
        assert_eq!(keys, vec![b"a\x001".to_vec(), b"a\x002".to_vec()]);
    }

    #[test]
    fn scan_prefix_rev_handles_high_bytes() {
        let store = store_with(&[(b"p\xff\x01", b""), (b"p\xff\x02", b""), (b"q", b"")]);
        let txn = store.begin(true).unwrap();
        let ks = txn.keyspace("t").unwrap();
        let keys: Vec<Vec<u8>> = txn
            .scan_prefix_rev(&ks, b"p\xff")
            .unwrap()
            .map(|r| r.unwrap().0.into_owned())
            .collect();
        assert_eq!(keys, vec![b"p\xff\x02".to_vec(), b"p\xff\x01".to_vec()]);
    }

    #[test]
    fn scan_from_seeks_ge_within_region() {
        let store = store_with(&[(b"k1", b""), (b"k3", b""), (b"k5", b""), (b"l1", b"")]);
        let txn = store.begin(true).unwrap();
        let ks = txn.keyspace("t").unwrap();
        let keys: Vec<Vec<u8>> = txn
            .scan_from(&ks, b"k", b"k2")
            .unwrap()
            .map(|r| r.unwrap().0.into_owned())
            .collect();
        assert_eq!(keys, vec![b"k3".to_vec(), b"k5".to_vec()]);

        // A start below the region clamps to the region start.
        let keys: Vec<Vec<u8>> = txn
            .scan_from(&ks, b"k", b"a")
            .unwrap()
            .map(|r| r.unwrap().0.into_owned())
            .collect();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn scan_from_rev_seeks_le_within_region() {
        let store = store_with(&[(b"k1", b""), (b"k3", b""), (b"k5", b""), (b"l1", b"")]);
        let txn = store.begin(true).unwrap();
        let ks = txn.keyspace("t").unwrap();
        let keys: Vec<Vec<u8>> = txn
            .scan_from_rev(&ks, b"k", b"k4")
            .unwrap()
            .map(|r| r.unwrap().0.into_owned())
            .collect();
        assert_eq!(keys, vec![b"k3".to_vec(), b"k1".to_vec()]);

        // An end beyond the region clamps to the region end.
        let keys: Vec<Vec<u8>> = txn
            .scan_from_rev(&ks, b"k", b"z")
            .unwrap()
            .map(|r| r.unwrap().0.into_owned())
            .collect();
        assert_eq!(keys, vec![b"k5".to_vec(), b"k3".to_vec(), b"k1".to_vec()]);
    }

    #[test]
    fn read_only_rejects_writes_and_commit() {
        let store = store_with(&[]);
        let txn = store.begin(true).unwrap();
        let ks = txn.keyspace("t").unwrap();
        assert!(matches!(
            txn.put(&ks, b"k", b"v"),
            Err(StoreError::ReadOnly)
        ));
        assert!(matches!(txn.commit(), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn rollback_discards_writes() {
        let store = store_with(&[]);
        let txn = store.begin(false).unwrap();
        let ks = txn.keyspace("t").unwrap();
        txn.put(&ks, b"k", b"v").unwrap();
        txn.rollback().unwrap();

        let txn = store.begin(true).unwrap();
        let ks = txn.keyspace("t").unwrap();
        assert!(txn.get(&ks, b"k").unwrap().is_none());
    }

    #[test]
    fn rename_moves_data_and_missing_source_errors() {
        let store = store_with(&[(b"k", b"v")]);
        store.rename_keyspace("t", "u").unwrap();
        let txn = store.begin(true).unwrap();
        assert!(txn.keyspace("t").is_err());
        let ks = txn.keyspace("u").unwrap();
        assert_eq!(txn.get(&ks, b"k").unwrap().unwrap().as_ref(), b"v");
        assert!(matches!(
            store.rename_keyspace("t", "w"),
            Err(StoreError::KeyspaceNotFound(_))
        ));
    }

    #[test]
    fn whole_store_snapshot_spans_keyspaces() {
        let store = store_with(&[(b"k", b"1")]);
        store.create_keyspace("other").unwrap();

        let reader = store.begin(true).unwrap();

        let writer = store.begin(false).unwrap();
        let t = writer.keyspace("t").unwrap();
        let o = writer.keyspace("other").unwrap();
        writer.put(&t, b"k", b"2").unwrap();
        writer.put(&o, b"x", b"y").unwrap();
        writer.commit().unwrap();

        // Both keyspaces look pre-commit through the pinned root.
        let t = reader.keyspace("t").unwrap();
        let o = reader.keyspace("other").unwrap();
        assert_eq!(reader.get(&t, b"k").unwrap().unwrap().as_ref(), b"1");
        assert!(reader.get(&o, b"x").unwrap().is_none());
    }
}
