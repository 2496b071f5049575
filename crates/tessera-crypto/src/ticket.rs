//! Key-exchange message carried by a ticket

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{CryptoError, SessionId};

/// Size of an epoch key in bytes
pub const EPOCH_KEY_SIZE: usize = 32;

/// One epoch's key-exchange message.
///
/// Embeds the session id and epoch so that both can be recovered from the
/// serialized bytes without a separate header. The epoch key is zeroized on
/// drop and redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketMessage {
    session_id: SessionId,
    epoch: u32,
    epoch_key: [u8; EPOCH_KEY_SIZE],
}

impl TicketMessage {
    /// Epoch-0 message for a new session. `epoch_key` must be fresh random
    /// bytes from the caller.
    pub fn new_session(session_id: SessionId, epoch_key: [u8; EPOCH_KEY_SIZE]) -> Self {
        Self { session_id, epoch: 0, epoch_key }
    }

    pub(crate) fn new(session_id: SessionId, epoch: u32, epoch_key: [u8; EPOCH_KEY_SIZE]) -> Self {
        Self { session_id, epoch, epoch_key }
    }

    /// Session this message belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Epoch this message introduces.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub(crate) fn epoch_key(&self) -> &[u8; EPOCH_KEY_SIZE] {
        &self.epoch_key
    }

    /// Encode to CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Ok(bytes)
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// - `Encoding`: bytes are not a valid ticket message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        ciborium::from_reader(bytes).map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}

impl Drop for TicketMessage {
    fn drop(&mut self) {
        self.epoch_key.zeroize();
    }
}

impl fmt::Debug for TicketMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketMessage")
            .field("session_id", &self.session_id)
            .field("epoch", &self.epoch)
            .field("epoch_key", &"<redacted>")
            .finish()
    }
}
