//! Store transactions.
//!
//! A `StoreTxn` buffers every mutation in an ordered overlay keyed by
//! `(column, key)`. Reads are read-your-writes, so loading a row mutated
//! earlier in the same transaction always observes the in-flight version
//! (the identity-session guarantee). `commit` flushes the overlay as a
//! single atomic `WriteBatch`; dropping the transaction without committing
//! leaves the backing store untouched.

use std::collections::BTreeMap;
use std::ops::Bound;

use vaultd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub(crate) struct StoreTxn<'a> {
    store: &'a dyn KeyValueStore,
    overlay: BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>,
}

impl<'a> StoreTxn<'a> {
    pub fn new(store: &'a dyn KeyValueStore) -> Self {
        Self {
            store,
            overlay: BTreeMap::new(),
        }
    }

    pub fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(pending) = self.overlay.get(&(column, key.to_vec())) {
            return Ok(pending.clone());
        }
        self.store.get(column, key)
    }

    pub fn put(&mut self, column: Column, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.insert((column, key), Some(value));
    }

    pub fn delete(&mut self, column: Column, key: Vec<u8>) {
        self.overlay.insert((column, key), None);
    }

    /// Ordered prefix scan over the backing store merged with the overlay.
    pub fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .store
            .scan_prefix(column, prefix)?
            .into_iter()
            .collect();

        let start = Bound::Included((column, prefix.to_vec()));
        for ((entry_column, key), pending) in self.overlay.range((start, Bound::Unbounded)) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub fn commit(self) -> Result<(), StoreError> {
        if self.overlay.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for ((column, key), pending) in self.overlay {
            match pending {
                Some(value) => batch.put(column, key, value),
                None => batch.delete(column, key),
            }
        }
        self.store.write_batch(&batch)
    }
}
