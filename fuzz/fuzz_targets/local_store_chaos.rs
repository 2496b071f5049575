//! Fuzz target for the local ticket store under storage failures
//!
//! Uses ChaoticStorage to fail random batches while groups are stored,
//! extended and deleted. A second store reads the undisturbed inner storage.
//!
//! # Invariants
//!
//! - Storage errors propagate as Result::Err, never panics
//! - The info file and ticket set are never observed half-written
//! - A stored window always folds and never exceeds the retention limit

#![no_main]

use std::collections::BTreeSet;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tessera_core::{
    GroupInfo, Identity, LocalLookup, LocalTicketStore, MemoryStorage, ParticipantLimits, RawGroup,
    SessionId, Ticket, storage::ChaoticStorage,
};
use tessera_crypto::GroupSession;

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Retention limit (1-8)
    max_tickets: u8,
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ChaosOperation {
    /// Replace the group with the first `len` tickets of the chain
    StoreGroup { len: u8 },
    /// Append the epoch after the stored head
    StoreNext,
    /// Purge the group
    Delete,
    /// Read the last `count` tickets through the chaotic store
    Retrieve { count: u8 },
}

const CHAIN_LEN: u32 = 24;

fuzz_target!(|scenario: ChaosScenario| {
    let Ok(session_id) = SessionId::derive(b"fuzz-local-store-session") else {
        return;
    };
    let Some(chain) = ticket_chain(session_id) else {
        return;
    };

    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let max_tickets = usize::from(scenario.max_tickets % 8) + 1;
    let chaotic =
        ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, scenario.chaos_seed);
    let store = LocalTicketStore::new(chaotic.clone(), max_tickets);
    let mirror = LocalTicketStore::new(chaotic.inner().clone(), max_tickets);
    let info = GroupInfo { initiator: Identity::from("alice") };

    for op in scenario.operations.into_iter().take(64) {
        match op {
            ChaosOperation::StoreGroup { len } => {
                let len = usize::from(len) % chain.len() + 1;
                if let Ok(raw) = RawGroup::new(info.clone(), chain[..len].to_vec()) {
                    let _ = store.store_group(&raw);
                }
            },
            ChaosOperation::StoreNext => {
                let Ok(epochs) = mirror.epochs(&session_id) else {
                    continue;
                };
                let next = epochs.last().and_then(|head| chain.get(*head as usize + 1));
                if let Some(next) = next {
                    let _ = store.store_ticket(next);
                }
            },
            ChaosOperation::Delete => {
                let _ = store.delete(&session_id);
            },
            ChaosOperation::Retrieve { count } => {
                let _ = store.retrieve_group(&session_id, usize::from(count));
            },
        }

        verify_window(&mirror, &session_id, max_tickets);
    }
});

fn ticket_chain(session_id: SessionId) -> Option<Vec<Ticket>> {
    let limits = ParticipantLimits::default();
    let participants = BTreeSet::from([Identity::from("alice"), Identity::from("bob")]);

    let first = Ticket::create(session_id, participants.clone(), [0; 32], limits).ok()?;
    let mut session = GroupSession::from_tickets([first.message()]).ok()?;
    let mut tickets = vec![first];
    for i in 1..CHAIN_LEN {
        let next = Ticket::next(&session, participants.clone(), [i as u8; 32], limits).ok()?;
        session.add_epoch(next.message()).ok()?;
        tickets.push(next);
    }
    Some(tickets)
}

fn verify_window(
    mirror: &LocalTicketStore<MemoryStorage>,
    session_id: &SessionId,
    max_tickets: usize,
) {
    match mirror.retrieve_group(session_id, usize::MAX) {
        LocalLookup::Absent => {},
        LocalLookup::Found(raw) => {
            assert!(raw.tickets.len() <= max_tickets, "retention limit exceeded");
            let folded = GroupSession::from_tickets(raw.tickets.iter().map(Ticket::message));
            assert!(folded.is_ok(), "stored window must fold: {folded:?}");
        },
        LocalLookup::Corrupt(err) => panic!("partial group stored: {err}"),
    }
}
