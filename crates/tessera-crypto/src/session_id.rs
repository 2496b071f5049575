//! Session id derivation
//!
//! A session id is SHA-512 of the caller's identifier, truncated to 32 bytes.
//! Identifiers of 10 bytes or fewer are rejected so that guessable short
//! names cannot collide across groups.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::CryptoError;

/// Size of a session id in bytes
pub const SESSION_ID_SIZE: usize = 32;

/// Identifiers must be strictly longer than this
pub const MIN_IDENTIFIER_LEN: usize = 10;

/// Stable identifier of one group conversation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Derive the session id for a caller-supplied identifier.
    ///
    /// # Errors
    ///
    /// - `ShortIdentifier`: identifier is `MIN_IDENTIFIER_LEN` bytes or shorter
    pub fn derive(identifier: &[u8]) -> Result<Self, CryptoError> {
        if identifier.len() <= MIN_IDENTIFIER_LEN {
            return Err(CryptoError::ShortIdentifier {
                len: identifier.len(),
                min: MIN_IDENTIFIER_LEN,
            });
        }

        let digest = Sha512::digest(identifier);
        let mut id = [0u8; SESSION_ID_SIZE];
        id.copy_from_slice(&digest[..SESSION_ID_SIZE]);
        Ok(Self(id))
    }

    /// Wrap raw session id bytes (e.g. read back from storage).
    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw session id bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }

    /// Lowercase hex encoding, used as the storage path segment.
    pub fn to_hex(&self) -> String {
        use fmt::Write;

        let mut out = String::with_capacity(SESSION_ID_SIZE * 2);
        for byte in self.0 {
            let Ok(()) = write!(out, "{byte:02x}") else {
                unreachable!("writing to a String cannot fail");
            };
        }
        out
    }

    /// First four bytes as hex, for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.short())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
