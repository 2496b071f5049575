//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! [`Storage::apply`] batch is one write transaction, so a crash or error
//! part-way through leaves the previous state intact.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};

use super::{Storage, StorageError, StorageOp, is_within, validate_ops, validate_subdir};

/// Table: files
/// Key: `subdir \0 name` (subdirs and names never contain `\0`)
/// Value: file contents
const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Separator between subdir and name in table keys
const SEPARATOR: char = '\0';

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(FILES).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Remove every key whose subdir satisfies `matches`, in one transaction.
    fn remove_where(&self, matches: impl Fn(&str) -> bool) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(FILES).map_err(|e| StorageError::Io(e.to_string()))?;

            let mut doomed = Vec::new();
            for entry in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
                let (key, _) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
                let key = key.value();
                if matches(split_key(key).0) {
                    doomed.push(key.to_string());
                }
            }

            for key in doomed {
                table.remove(key.as_str()).map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}

impl Storage for RedbStorage {
    fn apply(&self, ops: &[StorageOp]) -> Result<(), StorageError> {
        validate_ops(ops)?;

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(FILES).map_err(|e| StorageError::Io(e.to_string()))?;

            for op in ops {
                match op {
                    StorageOp::Put { subdir, name, data } => {
                        let key = encode_key(subdir, name);
                        table
                            .insert(key.as_str(), data.as_slice())
                            .map_err(|e| StorageError::Io(e.to_string()))?;
                    },
                    StorageOp::Delete { subdir, name } => {
                        let key = encode_key(subdir, name);
                        table.remove(key.as_str()).map_err(|e| StorageError::Io(e.to_string()))?;
                    },
                }
            }
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn read(&self, subdir: &str, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(FILES).map_err(|e| StorageError::Io(e.to_string()))?;

        let key = encode_key(subdir, name);
        let value = table.get(key.as_str()).map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn file_names(&self, subdir: &str) -> Result<Vec<String>, StorageError> {
        validate_subdir(subdir)?;

        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(FILES).map_err(|e| StorageError::Io(e.to_string()))?;

        // Every key of `subdir` sorts between "subdir\0" and "subdir\x01"
        let start = format!("{subdir}{SEPARATOR}");
        let end = format!("{subdir}\u{1}");

        let mut names = Vec::new();
        for entry in
            table.range(start.as_str()..end.as_str()).map_err(|e| StorageError::Io(e.to_string()))?
        {
            let (key, _) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            names.push(split_key(key.value()).1.to_string());
        }

        Ok(names)
    }

    fn delete_dir(&self, subdir: &str) -> Result<(), StorageError> {
        validate_subdir(subdir)?;
        self.remove_where(|dir| is_within(dir, subdir))
    }

    fn reset(&self) -> Result<(), StorageError> {
        self.remove_where(|_| true)
    }
}

fn encode_key(subdir: &str, name: &str) -> String {
    format!("{subdir}{SEPARATOR}{name}")
}

fn split_key(key: &str) -> (&str, &str) {
    key.split_once(SEPARATOR).unwrap_or((key, ""))
}
