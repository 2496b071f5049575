//! Cloud key-value collaborator
//!
//! The authoritative copy of every ticket lives in an access-controlled,
//! end-to-end encrypted key-value service. Values are addressed by
//! `(owner, root, path, key)`; only the owner may write, and only identities
//! on a value's access list may read it. [`KeyValueCloud`] is the client
//! surface this crate consumes. [`MemoryCloud`] is an in-process service
//! with the same semantics for tests and simulations.

mod memory;
mod ticket_store;

use std::collections::BTreeSet;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
pub use memory::{MemoryCloud, MemoryCloudClient};
use thiserror::Error;
pub use ticket_store::{CloudTicketStore, GROUP_SESSIONS_ROOT};

use crate::identity::{Card, Identity};

/// Errors from the cloud collaborator and the cloud ticket store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    /// Network or service failure
    #[error("transport error: {0}")]
    Transport(String),

    /// No value at the requested address
    #[error("value not found: {path}")]
    NotFound {
        /// Address that was requested
        path: String,
    },

    /// Caller is not allowed to perform the operation
    #[error("access denied: {reason}")]
    AccessDenied {
        /// Why access was refused
        reason: String,
    },

    /// Previous-hash guard did not match the stored value
    #[error("value hash mismatch")]
    HashMismatch,

    /// Value signature did not verify under any supplied key
    #[error("value signature verification failed")]
    VerificationFailed,

    /// Identity is not on the access list of any addressed value
    #[error("recipient {identity} not found")]
    RecipientNotFound {
        /// Identity that was not found
        identity: Identity,
    },

    /// Cloud key is not a decimal epoch
    #[error("invalid epoch key: {key}")]
    InvalidEpochKey {
        /// Offending key
        key: String,
    },

    /// Pulled ticket does not match the address it was stored under
    #[error("corrupt ticket: {reason}")]
    CorruptTicket {
        /// What did not match
        reason: String,
    },

    /// Value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CloudError {
    /// Returns true if a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Address of one value, relative to its owner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueAddress {
    /// Top-level namespace
    pub root: String,
    /// Path within the namespace
    pub path: String,
    /// Key within the path
    pub key: String,
}

impl ValueAddress {
    /// Build an address.
    pub fn new(root: impl Into<String>, path: impl Into<String>, key: impl Into<String>) -> Self {
        Self { root: root.into(), path: path.into(), key: key.into() }
    }
}

/// Hash of a stored value version, used as an optimistic-concurrency guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueHash(pub [u8; 32]);

/// Result of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledValue {
    /// Decrypted, signature-checked value
    pub value: Vec<u8>,
    /// Access list: the owner and every recipient
    pub identities: BTreeSet<Identity>,
    /// Hash of this version
    pub hash: ValueHash,
}

/// Client of the cloud key-value service, bound to one calling identity.
#[async_trait]
pub trait KeyValueCloud: Send + Sync {
    /// Identity the client acts as.
    fn identity(&self) -> &Identity;

    /// Store a value owned by the caller, readable by `recipients` and the
    /// caller. `previous_hash` guards against overwriting a concurrent
    /// change; `None` overwrites blindly.
    async fn push_value(
        &self,
        address: &ValueAddress,
        data: &[u8],
        recipients: &[Card],
        previous_hash: Option<ValueHash>,
    ) -> Result<ValueHash, CloudError>;

    /// Read a value owned by `owner`, checking its signature against any of
    /// `verifiers`.
    async fn pull_value(
        &self,
        owner: &Identity,
        address: &ValueAddress,
        verifiers: &[VerifyingKey],
    ) -> Result<PulledValue, CloudError>;

    /// Keys under `owner`'s `root/path` that the caller can read.
    async fn get_keys(
        &self,
        owner: &Identity,
        root: &str,
        path: &str,
    ) -> Result<BTreeSet<String>, CloudError>;

    /// Grant `new_recipients` access to the caller's existing value without
    /// changing its contents.
    async fn update_recipients(
        &self,
        address: &ValueAddress,
        value: &[u8],
        previous_hash: ValueHash,
        new_recipients: &[Card],
    ) -> Result<(), CloudError>;

    /// Remove `identity` from the access list of the caller's values under
    /// `root/path` (one key, or every key when `key` is `None`).
    async fn delete_recipient(
        &self,
        identity: &Identity,
        root: &str,
        path: &str,
        key: Option<&str>,
    ) -> Result<(), CloudError>;

    /// Delete the caller's values under `root/path` (one key, or all).
    /// Deleting nothing succeeds.
    async fn reset_value(&self, root: &str, path: &str, key: Option<&str>)
    -> Result<(), CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(CloudError::Transport("timeout".into()).is_transient());
        assert!(!CloudError::VerificationFailed.is_transient());
        assert!(!CloudError::AccessDenied { reason: "revoked".into() }.is_transient());
    }
}
