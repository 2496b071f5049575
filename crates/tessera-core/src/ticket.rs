//! Tickets and the persisted group unit.
//!
//! A [`Ticket`] is one epoch's key-exchange message plus the identities
//! entitled to it. Tickets are immutable; a participant-set change mints a
//! new ticket for the next epoch instead of editing an old one.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tessera_crypto::{EPOCH_KEY_SIZE, GroupSession, SessionId, TicketMessage};

use crate::{
    config::ParticipantLimits, error::GroupError, identity::Identity, storage::StorageError,
};

/// One epoch of a group: key-exchange message and participant set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    message: TicketMessage,
    participants: BTreeSet<Identity>,
}

impl Ticket {
    /// Epoch-0 ticket for a new session.
    ///
    /// # Errors
    ///
    /// - `InvalidParticipantsCount`: participant count outside `limits`
    pub fn create(
        session_id: SessionId,
        participants: BTreeSet<Identity>,
        epoch_key: [u8; EPOCH_KEY_SIZE],
        limits: ParticipantLimits,
    ) -> Result<Self, GroupError> {
        limits.validate(participants.len())?;
        Ok(Self { message: TicketMessage::new_session(session_id, epoch_key), participants })
    }

    /// Ticket for the epoch after the session's current one.
    ///
    /// # Errors
    ///
    /// - `InvalidParticipantsCount`: participant count outside `limits`
    /// - `Crypto`: session is empty or the epoch counter is exhausted
    pub fn next(
        session: &GroupSession,
        participants: BTreeSet<Identity>,
        epoch_key: [u8; EPOCH_KEY_SIZE],
        limits: ParticipantLimits,
    ) -> Result<Self, GroupError> {
        limits.validate(participants.len())?;
        let message = session.create_ticket(epoch_key)?;
        Ok(Self { message, participants })
    }

    /// Reassemble a ticket from a pulled message and its access list.
    pub fn from_parts(message: TicketMessage, participants: BTreeSet<Identity>) -> Self {
        Self { message, participants }
    }

    /// Same key-exchange message with a different participant set.
    pub fn with_participants(&self, participants: BTreeSet<Identity>) -> Self {
        Self { message: self.message.clone(), participants }
    }

    /// Session this ticket belongs to.
    pub fn session_id(&self) -> SessionId {
        self.message.session_id()
    }

    /// Epoch this ticket introduces.
    pub fn epoch(&self) -> u32 {
        self.message.epoch()
    }

    /// Key-exchange message.
    pub fn message(&self) -> &TicketMessage {
        &self.message
    }

    /// Identities entitled to this epoch.
    pub fn participants(&self) -> &BTreeSet<Identity> {
        &self.participants
    }

    /// Encode to CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        encode(self)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        decode(bytes)
    }
}

/// Immutable group metadata, written once at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Identity allowed to change membership and delete the group
    pub initiator: Identity,
}

impl GroupInfo {
    /// Encode to CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        encode(self)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        decode(bytes)
    }
}

/// Group info plus its tickets, the unit persisted in the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGroup {
    /// Group metadata
    pub info: GroupInfo,
    /// Tickets in ascending epoch order, never empty
    pub tickets: Vec<Ticket>,
}

impl RawGroup {
    /// Combine info and tickets, sorting tickets by epoch.
    ///
    /// # Errors
    ///
    /// - `InvalidGroup`: no tickets
    pub fn new(info: GroupInfo, mut tickets: Vec<Ticket>) -> Result<Self, GroupError> {
        if tickets.is_empty() {
            return Err(GroupError::InvalidGroup("group has no tickets".into()));
        }
        tickets.sort_by_key(Ticket::epoch);
        Ok(Self { info, tickets })
    }

    /// Session all tickets belong to.
    pub fn session_id(&self) -> Option<SessionId> {
        self.tickets.first().map(Ticket::session_id)
    }

    /// Highest-epoch ticket.
    pub fn latest(&self) -> Option<&Ticket> {
        self.tickets.last()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
