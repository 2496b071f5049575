//! Caller-facing errors for group operations.

use thiserror::Error;
use tessera_crypto::CryptoError;

use crate::{
    cloud::CloudError, identity::Identity, local_store::LocalStoreError, lookup::LookupError,
    storage::StorageError,
};

/// Errors surfaced by groups, the group manager and the user context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    /// Group is not in the local cache; load it from the cloud first
    #[error("group not cached locally")]
    MissingCachedGroup,

    /// Only the initiator may change participants
    #[error("only the group initiator may change participants")]
    GroupPermissionDenied,

    /// Cloud holds no tickets visible to the caller
    #[error("group not found")]
    GroupWasNotFound,

    /// Tickets do not form a usable group
    #[error("invalid group: {0}")]
    InvalidGroup(String),

    /// Requested participant change would not change anything, or would
    /// remove the initiator
    #[error("invalid participant change")]
    InvalidChangeParticipants,

    /// Participant count outside the configured bounds
    #[error("invalid participant count {count}, must be within [{min}, {max}]")]
    InvalidParticipantsCount {
        /// Resulting participant count
        count: usize,
        /// Lower bound
        min: usize,
        /// Upper bound
        max: usize,
    },

    /// Sender signature did not verify
    #[error("message verification failed")]
    VerificationFailed,

    /// Group identifier too short to derive a session id
    #[error("group identifier too short: {len} bytes")]
    ShortGroupId {
        /// Identifier length in bytes
        len: usize,
    },

    /// Message belongs to another session
    #[error("message is not from this group")]
    MessageNotFromThisGroup,

    /// Message epoch is newer than the local session; call `update` first
    #[error("group is outdated: message epoch {message_epoch}, current epoch {current_epoch}")]
    GroupIsOutdated {
        /// Epoch carried by the message
        message_epoch: u32,
        /// Highest epoch folded locally
        current_epoch: u32,
    },

    /// Local and cloud state disagree in a way no retry fixes
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    /// No private key established for the user session
    #[error("private key not established")]
    MissingPrivateKey,

    /// Some identities kept access after a removal
    #[error("access removal failed for {} identities", failed.len())]
    PartialAccessRemoval {
        /// Identities still holding access, with the cause
        failed: Vec<(Identity, String)>,
    },

    /// Both the cloud and the local half of a delete failed
    #[error("delete incomplete: cloud: {cloud}; local: {local}")]
    DeleteIncomplete {
        /// Cloud failure
        cloud: String,
        /// Local failure
        local: String,
    },

    /// Configuration rejected at startup
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Local ticket store failure
    #[error(transparent)]
    LocalStore(#[from] LocalStoreError),

    /// Cloud failure
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// Card lookup failure
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Local persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Coarse classification of a [`GroupError`] for callers deciding how to
/// recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected miss; recover by pulling from the cloud
    NotFound,
    /// Caller is not allowed to do this
    Permission,
    /// Caller passed bad input; nothing was touched
    InvalidInput,
    /// Local session is behind; recover with `update`
    Staleness,
    /// Signature or decryption failure
    Cryptographic,
    /// Local state for the session is unusable
    StorageCorruption,
    /// Cloud call failed
    Transport,
}

impl GroupError {
    /// Classify for recovery.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingCachedGroup | Self::GroupWasNotFound => ErrorKind::NotFound,
            Self::GroupPermissionDenied | Self::MissingPrivateKey => ErrorKind::Permission,
            Self::InvalidChangeParticipants
            | Self::InvalidParticipantsCount { .. }
            | Self::ShortGroupId { .. }
            | Self::MessageNotFromThisGroup
            | Self::Config(_) => ErrorKind::InvalidInput,
            Self::GroupIsOutdated { .. } => ErrorKind::Staleness,
            Self::VerificationFailed | Self::Crypto(_) => ErrorKind::Cryptographic,
            Self::InvalidGroup(_)
            | Self::InconsistentState(_)
            | Self::LocalStore(_)
            | Self::Storage(_) => ErrorKind::StorageCorruption,
            Self::PartialAccessRemoval { .. } | Self::DeleteIncomplete { .. } => {
                ErrorKind::Transport
            },
            Self::Cloud(err) => match err {
                CloudError::NotFound { .. } => ErrorKind::NotFound,
                CloudError::AccessDenied { .. } => ErrorKind::Permission,
                CloudError::VerificationFailed => ErrorKind::Cryptographic,
                CloudError::CorruptTicket { .. } | CloudError::InvalidEpochKey { .. } => {
                    ErrorKind::StorageCorruption
                },
                _ => ErrorKind::Transport,
            },
            Self::Lookup(err) => match err {
                LookupError::CardNotFound { .. } | LookupError::MissingCachedCard { .. } => {
                    ErrorKind::NotFound
                },
                LookupError::MissingIdentities => ErrorKind::InvalidInput,
                LookupError::DuplicateCards { .. } | LookupError::CardChainTooDeep { .. } => {
                    ErrorKind::Cryptographic
                },
                LookupError::Directory(_) => ErrorKind::Transport,
                LookupError::Storage(_) => ErrorKind::StorageCorruption,
            },
        }
    }

    /// Whether the same call may succeed after recovery (`pull`, `update`,
    /// or simply trying again).
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::Staleness | ErrorKind::Transport)
    }
}
