//! Local ticket cache.
//!
//! Layout inside the [`Storage`] namespace:
//!
//! ```text
//! groups/<hex(session_id)>/GROUP-INFO        CBOR GroupInfo
//! groups/<hex(session_id)>/TICKETS/<epoch>   CBOR Ticket
//! ```
//!
//! Every write is a single [`Storage::apply`] batch, so readers never see a
//! group whose info and ticket files disagree. At most `max_tickets` epochs
//! are retained per session; older ones are evicted in the same batch that
//! adds newer ones.

use std::{
    collections::{BTreeMap, BTreeSet},
    slice,
};

use tessera_crypto::SessionId;
use thiserror::Error;
use tracing::debug;

use crate::{
    storage::{Storage, StorageError, StorageOp},
    ticket::{GroupInfo, RawGroup, Ticket},
};

/// Root directory of all group state
const GROUPS_ROOT: &str = "groups";

/// File holding the CBOR `GroupInfo`
const GROUP_INFO_NAME: &str = "GROUP-INFO";

/// Subdirectory holding one file per epoch
const TICKETS_SUBDIR: &str = "TICKETS";

/// Errors from the local ticket store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalStoreError {
    /// An epoch is listed but its file is missing or empty
    #[error("empty or missing file: {path}")]
    EmptyFile {
        /// Storage path of the file
        path: String,
    },

    /// A ticket file name is not a decimal epoch
    #[error("invalid ticket file name: {name}")]
    InvalidFileName {
        /// Offending file name
        name: String,
    },

    /// A group was stored or read back without tickets
    #[error("group has no tickets")]
    EmptyTickets,

    /// Tickets exist but the group info file does not
    #[error("group info missing for session {session}")]
    MissingGroupInfo {
        /// Session id (short hex)
        session: String,
    },

    /// Underlying storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of a local read that separates absence from corruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalLookup<T, E = LocalStoreError> {
    /// Value was read and decoded
    Found(T),
    /// Nothing stored; safe to fall back to the cloud
    Absent,
    /// Stored state is unreadable; the session needs repair
    Corrupt(E),
}

impl<T, E> LocalLookup<T, E> {
    /// `Some` only for `Found`.
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::Absent | Self::Corrupt(_) => None,
        }
    }

    /// Transform the found value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LocalLookup<U, E> {
        match self {
            Self::Found(value) => LocalLookup::Found(f(value)),
            Self::Absent => LocalLookup::Absent,
            Self::Corrupt(err) => LocalLookup::Corrupt(err),
        }
    }

    /// Transform the corruption cause.
    pub fn map_err<F>(self, f: impl FnOnce(E) -> F) -> LocalLookup<T, F> {
        match self {
            Self::Found(value) => LocalLookup::Found(value),
            Self::Absent => LocalLookup::Absent,
            Self::Corrupt(err) => LocalLookup::Corrupt(f(err)),
        }
    }
}

/// Per-device ticket cache keyed by session id and epoch.
#[derive(Clone)]
pub struct LocalTicketStore<S: Storage> {
    storage: S,
    max_tickets: usize,
}

impl<S: Storage> LocalTicketStore<S> {
    /// Store retaining at most `max_tickets` epochs per session.
    pub fn new(storage: S, max_tickets: usize) -> Self {
        Self { storage, max_tickets: max_tickets.max(1) }
    }

    /// Replace all local state for the group's session.
    ///
    /// # Errors
    ///
    /// - `EmptyTickets`: `raw` has no tickets
    pub fn store_group(&self, raw: &RawGroup) -> Result<(), LocalStoreError> {
        let session_id = raw.session_id().ok_or(LocalStoreError::EmptyTickets)?;
        let existing = self.epochs(&session_id)?;

        let mut ops = vec![StorageOp::put(
            group_dir(&session_id),
            GROUP_INFO_NAME,
            raw.info.to_bytes()?,
        )];

        let incoming: BTreeMap<u32, &Ticket> =
            raw.tickets.iter().map(|t| (t.epoch(), t)).collect();
        let keep: BTreeSet<u32> = incoming.keys().rev().take(self.max_tickets).copied().collect();

        for epoch in existing.iter().filter(|e| !keep.contains(e)) {
            ops.push(StorageOp::delete(tickets_dir(&session_id), epoch.to_string()));
        }
        for epoch in &keep {
            if let Some(ticket) = incoming.get(epoch) {
                ops.push(ticket_put(&session_id, ticket)?);
            }
        }

        self.storage.apply(&ops)?;
        debug!(session = %session_id.short(), tickets = keep.len(), "stored group");
        Ok(())
    }

    /// Append one ticket. Rewriting an existing epoch is idempotent.
    pub fn store_ticket(&self, ticket: &Ticket) -> Result<(), LocalStoreError> {
        self.store_tickets(slice::from_ref(ticket))
    }

    /// Append tickets atomically, evicting the oldest epochs beyond the
    /// retention limit in the same batch.
    pub fn store_tickets(&self, tickets: &[Ticket]) -> Result<(), LocalStoreError> {
        let mut by_session: BTreeMap<SessionId, Vec<&Ticket>> = BTreeMap::new();
        for ticket in tickets {
            by_session.entry(ticket.session_id()).or_default().push(ticket);
        }

        let mut ops = Vec::new();
        for (session_id, incoming) in &by_session {
            let existing = self.epochs(session_id)?;
            let mut all: BTreeSet<u32> = existing.clone();
            all.extend(incoming.iter().map(|t| t.epoch()));

            let keep: BTreeSet<u32> = all.iter().rev().take(self.max_tickets).copied().collect();

            for ticket in incoming.iter().filter(|t| keep.contains(&t.epoch())) {
                ops.push(ticket_put(session_id, ticket)?);
            }
            for epoch in existing.difference(&keep) {
                debug!(session = %session_id.short(), epoch, "evicting ticket");
                ops.push(StorageOp::delete(tickets_dir(session_id), epoch.to_string()));
            }
        }

        self.storage.apply(&ops)?;
        Ok(())
    }

    /// Epochs stored for a session.
    ///
    /// # Errors
    ///
    /// - `InvalidFileName`: a ticket file name is not a `u32`
    pub fn epochs(&self, session_id: &SessionId) -> Result<BTreeSet<u32>, LocalStoreError> {
        self.storage
            .file_names(&tickets_dir(session_id))?
            .into_iter()
            .map(|name| {
                name.parse::<u32>().map_err(|_| LocalStoreError::InvalidFileName { name })
            })
            .collect()
    }

    /// Up to `count` most recent tickets, ascending by epoch.
    ///
    /// # Errors
    ///
    /// - `EmptyFile`: a listed epoch has no readable contents
    /// - `InvalidFileName`: a ticket file name is not a `u32`
    pub fn retrieve_last(
        &self,
        count: usize,
        session_id: &SessionId,
    ) -> Result<Vec<Ticket>, LocalStoreError> {
        let epochs = self.epochs(session_id)?;
        let skip = epochs.len().saturating_sub(count);

        epochs
            .into_iter()
            .skip(skip)
            .map(|epoch| {
                self.read_ticket(session_id, epoch)?.ok_or_else(|| LocalStoreError::EmptyFile {
                    path: format!("{}/{epoch}", tickets_dir(session_id)),
                })
            })
            .collect()
    }

    /// Ticket for one epoch, `None` if not stored.
    pub fn retrieve_ticket(
        &self,
        session_id: &SessionId,
        epoch: u32,
    ) -> Result<Option<Ticket>, LocalStoreError> {
        self.read_ticket(session_id, epoch)
    }

    /// Group info, `None` if not stored.
    pub fn retrieve_info(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<GroupInfo>, LocalStoreError> {
        let dir = group_dir(session_id);
        match self.storage.read(&dir, GROUP_INFO_NAME)? {
            None => Ok(None),
            Some(bytes) if bytes.is_empty() => {
                Err(LocalStoreError::EmptyFile { path: format!("{dir}/{GROUP_INFO_NAME}") })
            },
            Some(bytes) => Ok(Some(GroupInfo::from_bytes(&bytes)?)),
        }
    }

    /// Info plus the last `count` tickets.
    pub fn retrieve_group(&self, session_id: &SessionId, count: usize) -> LocalLookup<RawGroup> {
        self.lookup(session_id, || self.retrieve_last(count, session_id))
    }

    /// Info plus the single ticket for `epoch`.
    pub fn retrieve_group_at(&self, session_id: &SessionId, epoch: u32) -> LocalLookup<RawGroup> {
        match self.retrieve_ticket(session_id, epoch) {
            Ok(Some(ticket)) => self.lookup(session_id, || Ok(vec![ticket])),
            Ok(None) => LocalLookup::Absent,
            Err(err) => LocalLookup::Corrupt(err),
        }
    }

    /// Purge everything stored for a session. No-op if absent.
    pub fn delete(&self, session_id: &SessionId) -> Result<(), LocalStoreError> {
        self.storage.delete_dir(&group_dir(session_id))?;
        debug!(session = %session_id.short(), "deleted local group");
        Ok(())
    }

    /// Purge every session.
    pub fn reset(&self) -> Result<(), LocalStoreError> {
        self.storage.delete_dir(GROUPS_ROOT)?;
        Ok(())
    }

    fn lookup(
        &self,
        session_id: &SessionId,
        tickets: impl FnOnce() -> Result<Vec<Ticket>, LocalStoreError>,
    ) -> LocalLookup<RawGroup> {
        let info = match self.retrieve_info(session_id) {
            Ok(info) => info,
            Err(err) => return LocalLookup::Corrupt(err),
        };
        let tickets = match tickets() {
            Ok(tickets) => tickets,
            Err(err) => return LocalLookup::Corrupt(err),
        };

        match (info, tickets.is_empty()) {
            (None, true) => LocalLookup::Absent,
            (None, false) => {
                let session = session_id.short();
                LocalLookup::Corrupt(LocalStoreError::MissingGroupInfo { session })
            },
            (Some(_), true) => LocalLookup::Corrupt(LocalStoreError::EmptyTickets),
            (Some(info), false) => match RawGroup::new(info, tickets) {
                Ok(raw) => LocalLookup::Found(raw),
                Err(_) => LocalLookup::Corrupt(LocalStoreError::EmptyTickets),
            },
        }
    }

    fn read_ticket(
        &self,
        session_id: &SessionId,
        epoch: u32,
    ) -> Result<Option<Ticket>, LocalStoreError> {
        let dir = tickets_dir(session_id);
        match self.storage.read(&dir, &epoch.to_string())? {
            None => Ok(None),
            Some(bytes) if bytes.is_empty() => {
                Err(LocalStoreError::EmptyFile { path: format!("{dir}/{epoch}") })
            },
            Some(bytes) => Ok(Some(Ticket::from_bytes(&bytes)?)),
        }
    }
}

fn group_dir(session_id: &SessionId) -> String {
    format!("{GROUPS_ROOT}/{}", session_id.to_hex())
}

fn tickets_dir(session_id: &SessionId) -> String {
    format!("{GROUPS_ROOT}/{}/{TICKETS_SUBDIR}", session_id.to_hex())
}

fn ticket_put(session_id: &SessionId, ticket: &Ticket) -> Result<StorageOp, LocalStoreError> {
    Ok(StorageOp::put(tickets_dir(session_id), ticket.epoch().to_string(), ticket.to_bytes()?))
}
