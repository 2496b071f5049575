//! Fuzz target for sealed group messages
//!
//! Decodes arbitrary bytes as a group message and, when that succeeds, tries
//! to open it against a real session. Forged messages must be rejected
//! without panicking.

#![no_main]

use ed25519_dalek::SigningKey;
use libfuzzer_sys::fuzz_target;
use tessera_crypto::{GroupMessage, GroupSession, SessionId, TicketMessage};

fuzz_target!(|data: &[u8]| {
    let Ok(message) = GroupMessage::from_bytes(data) else {
        return;
    };

    let Ok(session_id) = SessionId::derive(b"fuzz-group-session-id") else {
        return;
    };
    let mut session = GroupSession::new();
    if session.add_epoch(&TicketMessage::new_session(session_id, [7; 32])).is_err() {
        return;
    }

    let signer = SigningKey::from_bytes(&[1; 32]);
    assert!(session.decrypt(&message, &signer.verifying_key()).is_err());
});
