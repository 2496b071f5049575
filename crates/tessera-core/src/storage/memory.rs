#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use super::{Storage, StorageError, StorageOp, is_within, validate_ops, validate_subdir};

/// In-memory storage implementation for testing and simulation
///
/// Directories map to sorted file maps, all behind one `Arc<Mutex<>>` so a
/// batch is applied under a single lock acquisition. Uses `lock().expect()`,
/// which panics if the mutex is poisoned - acceptable for test code.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored files.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn file_count(&self) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.values().map(BTreeMap::len).sum()
    }
}

impl Storage for MemoryStorage {
    #[allow(clippy::expect_used)]
    fn apply(&self, ops: &[StorageOp]) -> Result<(), StorageError> {
        validate_ops(ops)?;

        let mut inner = self.inner.lock().expect("Mutex poisoned");
        for op in ops {
            match op {
                StorageOp::Put { subdir, name, data } => {
                    inner.entry(subdir.clone()).or_default().insert(name.clone(), data.clone());
                },
                StorageOp::Delete { subdir, name } => {
                    if let Some(files) = inner.get_mut(subdir) {
                        files.remove(name);
                        if files.is_empty() {
                            inner.remove(subdir);
                        }
                    }
                },
            }
        }
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn read(&self, subdir: &str, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.get(subdir).and_then(|files| files.get(name)).cloned())
    }

    #[allow(clippy::expect_used)]
    fn file_names(&self, subdir: &str) -> Result<Vec<String>, StorageError> {
        validate_subdir(subdir)?;
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.get(subdir).map(|files| files.keys().cloned().collect()).unwrap_or_default())
    }

    #[allow(clippy::expect_used)]
    fn delete_dir(&self, subdir: &str) -> Result<(), StorageError> {
        validate_subdir(subdir)?;
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.retain(|dir, _| !is_within(dir, subdir));
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn reset(&self) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").clear();
        Ok(())
    }
}
