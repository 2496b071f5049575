//! Tessera Cryptographic Primitives
//!
//! Cryptographic building blocks for Tessera group sessions. Pure functions
//! with deterministic outputs. Callers provide random bytes for deterministic
//! testing.
//!
//! # Key Lifecycle
//!
//! A group conversation is identified by a [`SessionId`] derived from a
//! caller-chosen identifier. Every participant-set change mints a new epoch,
//! carried by a [`TicketMessage`] holding a fresh 32-byte epoch key. Folding
//! the tickets in ascending epoch order produces a [`GroupSession`], which
//! encrypts under the highest epoch and decrypts any epoch it holds.
//!
//! ```text
//! Identifier (> 10 bytes)
//!        │
//!        ▼
//! SHA-512 truncated → SessionId
//!        │
//!        ▼
//! TicketMessage (session, epoch, epoch key)  ×  N, folded in order
//!        │
//!        ▼
//! HKDF → Message Key (per session, per epoch)
//!        │
//!        ▼
//! Ed25519 sign → XChaCha20-Poly1305 → GroupMessage
//! ```
//!
//! # Security
//!
//! Forward Secrecy at membership changes:
//! - Removing a participant mints a new epoch with an unrelated random key
//! - Removed participants never receive the new ticket
//!
//! Authenticity:
//! - Every message carries the sender's Ed25519 signature inside the AEAD
//! - The header (session id, epoch) is bound as associated data
//! - Failed authentication tag or signature -> reject message
//!
//! Ordering:
//! - The fold rejects gaps and foreign session ids, so a session built from
//!   an incomplete ticket window never silently decrypts with a wrong key

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod derivation;
mod encryption;
mod error;
mod session;
mod session_id;
mod ticket;

pub use derivation::{MessageKey, derive_message_key};
pub use encryption::{GroupMessage, NONCE_RANDOM_SIZE, SIGNATURE_SIZE};
pub use error::CryptoError;
pub use session::GroupSession;
pub use session_id::{MIN_IDENTIFIER_LEN, SESSION_ID_SIZE, SessionId};
pub use ticket::{EPOCH_KEY_SIZE, TicketMessage};
