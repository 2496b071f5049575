//! Local persistence abstraction
//!
//! A small file-system-like namespace: named blobs grouped in `/`-separated
//! subdirectories. The trait is synchronous (no async); local I/O is fast
//! compared with cloud round trips and callers serialize per session anyway.
//!
//! All multi-file writes go through [`Storage::apply`], which is
//! all-or-nothing. This is what keeps a group's info file and ticket set
//! consistent when an operation is cancelled or a write fails half-way.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;

pub use self::redb::RedbStorage;

/// One step of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Create or overwrite a file
    Put {
        /// Directory path, segments separated by `/`
        subdir: String,
        /// File name within `subdir`
        name: String,
        /// File contents
        data: Vec<u8>,
    },
    /// Remove a file if present
    Delete {
        /// Directory path, segments separated by `/`
        subdir: String,
        /// File name within `subdir`
        name: String,
    },
}

impl StorageOp {
    /// Put operation.
    pub fn put(subdir: impl Into<String>, name: impl Into<String>, data: Vec<u8>) -> Self {
        Self::Put { subdir: subdir.into(), name: name.into(), data }
    }

    /// Delete operation.
    pub fn delete(subdir: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Delete { subdir: subdir.into(), name: name.into() }
    }

    fn path(&self) -> (&str, &str) {
        match self {
            Self::Put { subdir, name, .. } | Self::Delete { subdir, name } => (subdir, name),
        }
    }
}

/// Local blob storage for ticket stores and card caches
///
/// Must be Clone (shared by managers and stores), Send + Sync (thread-safe),
/// and synchronous (no async methods). Implementations typically share
/// internal state via Arc, so clones access the same underlying storage.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned (a thread panicked while holding a lock).
pub trait Storage: Clone + Send + Sync + 'static {
    /// Apply a batch of puts and deletes atomically.
    ///
    /// # Invariants
    ///
    /// - Post: either every operation is visible or none is
    /// - Operations apply in order; a later put wins over an earlier one
    fn apply(&self, ops: &[StorageOp]) -> Result<(), StorageError>;

    /// Read a file. `None` if it does not exist.
    fn read(&self, subdir: &str, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Names of files directly inside `subdir`, sorted. Empty if the
    /// directory does not exist.
    fn file_names(&self, subdir: &str) -> Result<Vec<String>, StorageError>;

    /// Remove `subdir` and everything nested below it. No-op if absent.
    fn delete_dir(&self, subdir: &str) -> Result<(), StorageError>;

    /// Remove everything.
    fn reset(&self) -> Result<(), StorageError>;

    /// Write a single file.
    fn write(&self, subdir: &str, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.apply(&[StorageOp::put(subdir, name, data.to_vec())])
    }
}

/// Reject paths the backends cannot represent unambiguously.
pub(crate) fn validate_ops(ops: &[StorageOp]) -> Result<(), StorageError> {
    ops.iter().try_for_each(|op| {
        let (subdir, name) = op.path();
        validate_path(subdir, name)
    })
}

pub(crate) fn validate_path(subdir: &str, name: &str) -> Result<(), StorageError> {
    validate_subdir(subdir)?;
    if name.is_empty() || name.contains(['/', '\0']) {
        return Err(StorageError::InvalidPath(format!("{subdir}/{name}")));
    }
    Ok(())
}

pub(crate) fn validate_subdir(subdir: &str) -> Result<(), StorageError> {
    if subdir.is_empty() || subdir.contains('\0') || subdir.split('/').any(str::is_empty) {
        return Err(StorageError::InvalidPath(subdir.to_string()));
    }
    Ok(())
}

/// Whether `subdir` is `root` or nested below it.
pub(crate) fn is_within(subdir: &str, root: &str) -> bool {
    subdir == root || subdir.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(validate_path("abc/TICKETS", "3").is_ok());
        assert!(validate_path("abc", "").is_err());
        assert!(validate_path("abc", "a/b").is_err());
        assert!(validate_path("", "x").is_err());
        assert!(validate_path("abc//def", "x").is_err());
        assert!(validate_path("abc/", "x").is_err());
        assert!(validate_path("a\0b", "x").is_err());
    }

    #[test]
    fn nesting() {
        assert!(is_within("abc", "abc"));
        assert!(is_within("abc/TICKETS", "abc"));
        assert!(!is_within("abcd", "abc"));
        assert!(!is_within("ab", "abc"));
    }
}
