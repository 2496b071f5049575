//! Fuzz target for ticket and group info decoding
//!
//! Arbitrary bytes fed to every persisted record decoder must produce an
//! error, never a panic. Anything that does decode must re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_core::{GroupInfo, Ticket};
use tessera_crypto::TicketMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(ticket) = Ticket::from_bytes(data) {
        assert!(ticket.to_bytes().is_ok());
    }
    if let Ok(message) = TicketMessage::from_bytes(data) {
        assert!(message.to_bytes().is_ok());
    }
    let _ = GroupInfo::from_bytes(data);
});
