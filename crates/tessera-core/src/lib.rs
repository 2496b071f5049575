//! Tessera group ticket management.
//!
//! Keeps every participant's view of an end-to-end encrypted group in step.
//! The initiator of a group owns its tickets in the cloud; every participant
//! mirrors the recent ones locally and folds them into a live [`Group`].
//!
//! # Architecture
//!
//! ```text
//! UserSession ── Ready ──> GroupContext ──> GroupManager ──┬──> CloudTicketStore ──> KeyValueCloud
//!                              │                │           └──> LocalTicketStore ──> Storage
//!                              │                ▼
//!                              │              Group (folded GroupSession)
//!                              └──> LookupManager ──> CardDirectory (+ card cache in Storage)
//! ```
//!
//! # Components
//!
//! - [`UserSession`] / [`GroupContext`]: per-user entry point, key gated
//! - [`GroupManager`]: the only writer of tickets; one lock per session
//! - [`Group`]: encrypt, decrypt, update and membership changes
//! - [`LocalTicketStore`] / [`CloudTicketStore`]: ticket persistence
//! - [`LookupManager`]: identity to card resolution with a local cache
//! - [`Environment`]: clock and randomness, seeded in tests
//!
//! # Invariants
//!
//! - Cloud writes precede local writes; local never holds an unpushed epoch
//! - Removing a participant mints a new epoch they never receive
//! - A group built from a gapped ticket window fails to construct

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cloud;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod group;
pub mod identity;
pub mod local_store;
pub mod lookup;
pub mod manager;
pub mod storage;
pub mod ticket;

pub use cloud::{CloudError, CloudTicketStore, KeyValueCloud, MemoryCloud};
pub use config::{GroupConfig, ParticipantLimits};
pub use context::{Dependencies, GroupContext, UserSession};
pub use env::{Environment, SeededEnv, SystemEnv};
pub use error::{ErrorKind, GroupError};
pub use group::Group;
pub use identity::{Card, Identity, LocalKeyPair};
pub use local_store::{LocalLookup, LocalStoreError, LocalTicketStore};
pub use lookup::{CardDirectory, LookupError, LookupManager, MemoryDirectory};
pub use manager::{AccessRemoval, GroupManager};
pub use storage::{MemoryStorage, RedbStorage, Storage, StorageError};
pub use tessera_crypto::SessionId;
pub use ticket::{GroupInfo, RawGroup, Ticket};
