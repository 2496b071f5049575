//! Error types for group session cryptography

use thiserror::Error;

/// Errors from group session operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Session identifier is too short to derive a session id from
    #[error("identifier too short: {len} bytes, need more than {min}")]
    ShortIdentifier {
        /// Length of the rejected identifier
        len: usize,
        /// Exclusive lower bound on identifier length
        min: usize,
    },

    /// Operation needs at least one folded epoch
    #[error("group session holds no epochs")]
    EmptySession,

    /// Ticket or message belongs to a different session
    #[error("session id mismatch: expected {expected}, got {actual}")]
    SessionMismatch {
        /// Session id held by the group session (hex)
        expected: String,
        /// Session id carried by the input (hex)
        actual: String,
    },

    /// Ticket does not directly follow the highest folded epoch
    #[error("epoch gap: expected {expected}, got {got}")]
    EpochGap {
        /// The only epoch that may be folded next
        expected: u32,
        /// Epoch carried by the ticket
        got: u32,
    },

    /// Message was encrypted under an epoch this session does not hold
    #[error("epoch {epoch} not held by this session")]
    EpochNotFound {
        /// Requested epoch
        epoch: u32,
    },

    /// Minting another epoch would overflow the counter
    #[error("epoch counter overflow at {current}")]
    EpochOverflow {
        /// Highest epoch when overflow was detected
        current: u32,
    },

    /// AEAD authentication failed (wrong key or tampered ciphertext)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Sender signature did not verify under the supplied key
    #[error("invalid sender signature")]
    InvalidSignature,

    /// Wire bytes could not be encoded or decoded
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl CryptoError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors indicate tampering, corruption, or a caller bug.
    /// Transient errors may be recoverable by syncing newer epochs or
    /// re-resolving the sender's key.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ShortIdentifier { .. } => true,
            Self::SessionMismatch { .. } => true,
            Self::EpochGap { .. } => true,
            Self::EpochOverflow { .. } => true,
            Self::DecryptionFailed { .. } => true,
            Self::Encoding(_) => true,

            // Recoverable by pulling newer tickets or a historical card
            Self::EmptySession => false,
            Self::EpochNotFound { .. } => false,
            Self::InvalidSignature => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors_are_fatal() {
        assert!(CryptoError::EpochGap { expected: 3, got: 5 }.is_fatal());
        assert!(CryptoError::ShortIdentifier { len: 4, min: 10 }.is_fatal());
        assert!(CryptoError::DecryptionFailed { reason: "tag".into() }.is_fatal());
    }

    #[test]
    fn sync_errors_are_recoverable() {
        assert!(!CryptoError::EpochNotFound { epoch: 9 }.is_fatal());
        assert!(!CryptoError::InvalidSignature.is_fatal());
        assert!(!CryptoError::EmptySession.is_fatal());
    }

    #[test]
    fn display_includes_context() {
        let err = CryptoError::EpochGap { expected: 3, got: 5 };
        assert_eq!(err.to_string(), "epoch gap: expected 3, got 5");
    }
}
