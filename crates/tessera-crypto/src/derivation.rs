//! Message key derivation using HKDF

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::SessionId;

/// Label used for message key derivation
const MESSAGE_KEY_LABEL: &[u8] = b"tesseraGroupMessageV1";

/// Symmetric key for `XChaCha20-Poly1305`, derived per (session, epoch).
///
/// Zeroized on drop.
#[derive(Clone)]
pub struct MessageKey {
    key: [u8; 32],
    epoch: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Epoch this key was derived for.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Derive the message key for one epoch of a session.
///
/// The epoch key from the ticket is never used directly as an AEAD key; the
/// session id and epoch are mixed in so that a key reused across sessions or
/// epochs still yields distinct message keys.
pub fn derive_message_key(epoch_key: &[u8; 32], session_id: &SessionId, epoch: u32) -> MessageKey {
    let hkdf = Hkdf::<Sha256>::new(Some(session_id.as_bytes()), epoch_key);

    // label || epoch
    let mut info = Vec::with_capacity(MESSAGE_KEY_LABEL.len() + 4);
    info.extend_from_slice(MESSAGE_KEY_LABEL);
    info.extend_from_slice(&epoch.to_be_bytes());

    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    MessageKey { key, epoch }
}
