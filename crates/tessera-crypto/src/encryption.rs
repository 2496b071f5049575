//! Group message encryption using `XChaCha20-Poly1305` and Ed25519
//!
//! All functions are pure - random bytes must be provided by the caller.
//!
//! The sender signs `label || session_id || epoch || plaintext` and the
//! signature is prepended to the plaintext before sealing, so only holders
//! of the epoch key learn who sent the message.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{CryptoError, MessageKey, SessionId};

/// Size of the random suffix in the nonce (20 bytes)
pub const NONCE_RANDOM_SIZE: usize = 20;

/// Ed25519 signature size (64 bytes)
pub const SIGNATURE_SIZE: usize = 64;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// Domain separation label for sender signatures
const SIGNATURE_LABEL: &[u8] = b"tesseraGroupSignatureV1";

/// An encrypted group message with the metadata needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Session the message was sent in
    pub session_id: SessionId,
    /// Epoch whose key sealed the message
    pub epoch: u32,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; 24],
    /// Sealed `signature || plaintext`, including the 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl GroupMessage {
    /// Plaintext length (ciphertext minus signature and authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(POLY1305_TAG_SIZE + SIGNATURE_SIZE)
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
    /// - `Encoding`: bytes are not a valid group message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        ciborium::from_reader(bytes).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    fn associated_data(session_id: &SessionId, epoch: u32) -> Vec<u8> {
        let mut aad = Vec::with_capacity(36);
        aad.extend_from_slice(session_id.as_bytes());
        aad.extend_from_slice(&epoch.to_be_bytes());
        aad
    }
}

/// Sign and seal `plaintext` under `message_key`.
pub(crate) fn seal(
    plaintext: &[u8],
    message_key: &MessageKey,
    session_id: SessionId,
    signer: &SigningKey,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> GroupMessage {
    let epoch = message_key.epoch();
    let signature = signer.sign(&signed_bytes(&session_id, epoch, plaintext));

    let mut body = Vec::with_capacity(SIGNATURE_SIZE + plaintext.len());
    body.extend_from_slice(&signature.to_bytes());
    body.extend_from_slice(plaintext);

    let nonce = build_nonce(epoch, random_suffix);
    let aad = GroupMessage::associated_data(&session_id, epoch);
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let Ok(ciphertext) =
        cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: &body, aad: &aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    GroupMessage { session_id, epoch, nonce, ciphertext }
}

/// Open a sealed message and verify the sender signature.
///
/// # Errors
///
/// - `DecryptionFailed`: authentication tag or key is incorrect (tamper)
/// - `InvalidSignature`: sealed payload was not signed by `verifier`
pub(crate) fn open(
    message: &GroupMessage,
    message_key: &MessageKey,
    verifier: &VerifyingKey,
) -> Result<Vec<u8>, CryptoError> {
    let aad = GroupMessage::associated_data(&message.session_id, message.epoch);
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let body = cipher
        .decrypt(
            XNonce::from_slice(&message.nonce),
            Payload { msg: &message.ciphertext, aad: &aad },
        )
        .map_err(|_| CryptoError::DecryptionFailed {
            reason: "authentication failed".to_string(),
        })?;

    if body.len() < SIGNATURE_SIZE {
        return Err(CryptoError::DecryptionFailed {
            reason: format!("sealed body too short: {} bytes", body.len()),
        });
    }

    let (signature_bytes, plaintext) = body.split_at(SIGNATURE_SIZE);
    let mut raw_signature = [0u8; SIGNATURE_SIZE];
    raw_signature.copy_from_slice(signature_bytes);
    let signature = Signature::from_bytes(&raw_signature);

    verifier
        .verify(&signed_bytes(&message.session_id, message.epoch, plaintext), &signature)
        .map_err(|_| CryptoError::InvalidSignature)?;

    Ok(plaintext.to_vec())
}

fn signed_bytes(session_id: &SessionId, epoch: u32, plaintext: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SIGNATURE_LABEL.len() + 36 + plaintext.len());
    bytes.extend_from_slice(SIGNATURE_LABEL);
    bytes.extend_from_slice(session_id.as_bytes());
    bytes.extend_from_slice(&epoch.to_be_bytes());
    bytes.extend_from_slice(plaintext);
    bytes
}

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-3: epoch (big-endian)
/// - bytes 4-23: random suffix (caller-provided)
fn build_nonce(epoch: u32, random_suffix: [u8; NONCE_RANDOM_SIZE]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..4].copy_from_slice(&epoch.to_be_bytes());
    nonce[4..24].copy_from_slice(&random_suffix);
    nonce
}
