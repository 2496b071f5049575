//! Fuzz target for folding ticket windows into a session
//!
//! Builds a contiguous ticket chain, cuts a window out of it and applies one
//! mutation before folding.
//!
//! # Invariants
//!
//! - A fold succeeds only for one session with contiguous epochs
//! - A successful fold reports the window's first and last epochs
//! - NEVER panic on out-of-order, duplicate or foreign tickets

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tessera_crypto::{GroupSession, SessionId, TicketMessage};

#[derive(Debug, Clone, Arbitrary)]
struct FoldInput {
    /// Chain length (1-32)
    len: u8,
    /// Tickets skipped from the front of the chain
    skip: u8,
    mutation: Mutation,
}

#[derive(Debug, Clone, Arbitrary)]
enum Mutation {
    None,
    Drop(u8),
    Duplicate(u8),
    Swap(u8, u8),
    Foreign(u8),
}

fuzz_target!(|input: FoldInput| {
    let (Ok(own), Ok(other)) =
        (SessionId::derive(b"fuzz-fold-session-a"), SessionId::derive(b"fuzz-fold-session-b"))
    else {
        return;
    };

    let len = usize::from(input.len % 32) + 1;
    let mut chain = GroupSession::new();
    let mut tickets = vec![TicketMessage::new_session(own, [0; 32])];
    if chain.add_epoch(&tickets[0]).is_err() {
        return;
    }
    while tickets.len() < len {
        let Ok(next) = chain.create_ticket([tickets.len() as u8; 32]) else {
            return;
        };
        if chain.add_epoch(&next).is_err() {
            return;
        }
        tickets.push(next);
    }

    let skip = usize::from(input.skip) % len;
    let mut window: Vec<TicketMessage> = tickets.split_off(skip);
    let last = window.len() - 1;

    let contiguous = match input.mutation {
        Mutation::None => true,
        Mutation::Drop(i) => {
            let i = usize::from(i) % window.len();
            window.remove(i);
            !window.is_empty() && (i == 0 || i == last)
        },
        Mutation::Duplicate(i) => {
            let i = usize::from(i) % window.len();
            window.insert(i, window[i].clone());
            false
        },
        Mutation::Swap(i, j) => {
            let (i, j) = (usize::from(i) % window.len(), usize::from(j) % window.len());
            window.swap(i, j);
            i == j
        },
        Mutation::Foreign(i) => {
            let i = usize::from(i) % (window.len() + 1);
            window.insert(i, TicketMessage::new_session(other, [0xff; 32]));
            false
        },
    };

    match GroupSession::from_tickets(window.iter()) {
        Ok(folded) => {
            assert!(contiguous, "non-contiguous window folded");
            assert_eq!(folded.epoch_count(), window.len());
            assert_eq!(folded.first_epoch(), window.first().map(TicketMessage::epoch));
            assert_eq!(folded.current_epoch(), window.last().map(TicketMessage::epoch));
        },
        Err(_) => assert!(!contiguous, "contiguous window rejected"),
    }
});
