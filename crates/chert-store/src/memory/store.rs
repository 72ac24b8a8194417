use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use imbl::OrdMap;

use crate::error::StoreError;
use crate::store::Store;

use super::transaction::MemoryTransaction;

pub(crate) type Keyspace = OrdMap<Vec<u8>, Vec<u8>>;

/// The whole store as one persistent value: keyspace name → ordered map.
pub(crate) type Root = OrdMap<String, Keyspace>;

/// In-memory store with whole-store snapshot semantics.
///
/// The entire store is a single persistent map published through one
/// `ArcSwap`. Readers pin a root and see every keyspace at the same
/// instant; the writer reworks a structural-sharing clone of that root
/// and swaps it in as one step on commit. A single gate serialises
/// writers, so no conflict detection is needed anywhere.
pub struct MemoryStore {
    root: ArcSwap<Root>,
    write_gate: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            root: ArcSwap::new(Arc::new(Root::new())),
            write_gate: Mutex::new(()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the current root.
    pub(crate) fn snapshot(&self) -> Arc<Root> {
        self.root.load_full()
    }

    /// Claim the single writer slot.
    pub(crate) fn lock_writer(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_gate
            .lock()
            .map_err(|_| StoreError::Storage("writer gate poisoned".into()))
    }

    /// Swap in a reworked root. The caller must hold the writer gate.
    pub(crate) fn publish(&self, root: Root) {
        self.root.store(Arc::new(root));
    }

    /// Store-level root edit: gate, clone, rework, publish. Keyspace
    /// lifecycle shares the writer gate with transactions, so a
    /// mid-flight write can never be clobbered by a concurrent create
    /// or drop.
    fn edit_root(
        &self,
        rework: impl FnOnce(&mut Root) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let _gate = self.lock_writer()?;
        let mut root = Root::clone(&self.snapshot());
        rework(&mut root)?;
        self.publish(root);
        Ok(())
    }
}

impl Store for MemoryStore {
    type Txn<'a> = MemoryTransaction<'a>;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError> {
        if read_only {
            Ok(MemoryTransaction::reader(self, self.snapshot()))
        } else {
            let gate = self.lock_writer()?;
            let working = Root::clone(&self.snapshot());
            Ok(MemoryTransaction::writer(self, working, gate))
        }
    }

    fn create_keyspace(&self, name: &str) -> Result<(), StoreError> {
        self.edit_root(|root| {
            if !root.contains_key(name) {
                root.insert(name.to_string(), Keyspace::new());
            }
            Ok(())
        })
    }

    fn drop_keyspace(&self, name: &str) -> Result<(), StoreError> {
        self.edit_root(|root| {
            root.remove(name);
            Ok(())
        })
    }

    fn rename_keyspace(&self, old: &str, new: &str) -> Result<(), StoreError> {
        self.edit_root(|root| match root.remove(old) {
            Some(space) => {
                root.insert(new.to_string(), space);
                Ok(())
            }
            None => Err(StoreError::KeyspaceNotFound(old.to_string())),
        })
    }

    fn list_keyspaces(&self) -> Result<Vec<String>, StoreError> {
        // The root is name-ordered already.
        Ok(self.snapshot().keys().cloned().collect())
    }
}
