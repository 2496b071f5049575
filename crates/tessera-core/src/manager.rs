//! Reconciliation of local and cloud ticket state.
//!
//! The [`GroupManager`] is the only component that writes tickets. Every
//! operation touching a session holds that session's lock for its whole
//! duration, so a `pull` can never interleave with a `store` or `delete` of
//! the same session. Different sessions never share a lock.
//!
//! # Ordering
//!
//! Cloud writes always happen before the matching local write. A local
//! store therefore never holds an epoch the cloud does not.

#![allow(clippy::disallowed_types, reason = "Lock registry is never held across an await")]

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use tessera_crypto::SessionId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::{
    cloud::{CloudError, CloudTicketStore, KeyValueCloud},
    config::GroupConfig,
    env::Environment,
    error::GroupError,
    group::Group,
    identity::{Card, Identity, LocalKeyPair},
    local_store::{LocalLookup, LocalTicketStore},
    lookup::LookupManager,
    storage::Storage,
    ticket::{GroupInfo, RawGroup, Ticket},
};

#[derive(Default)]
struct SessionSlot {
    lock: Arc<AsyncMutex<()>>,
    generation: u64,
}

/// Per-identity outcome of revoking access to a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRemoval {
    outcomes: BTreeMap<Identity, Result<(), CloudError>>,
}

impl AccessRemoval {
    /// Outcome for every identity that was processed.
    pub fn outcomes(&self) -> &BTreeMap<Identity, Result<(), CloudError>> {
        &self.outcomes
    }

    /// Identities that still hold access, with the cause.
    pub fn failed(&self) -> impl Iterator<Item = (&Identity, &CloudError)> {
        self.outcomes.iter().filter_map(|(identity, outcome)| match outcome {
            Ok(()) => None,
            Err(err) => Some((identity, err)),
        })
    }

    /// Whether every identity lost access.
    pub fn is_complete(&self) -> bool {
        self.outcomes.values().all(Result::is_ok)
    }

    /// `PartialAccessRemoval` naming the identities that kept access.
    pub fn into_result(self) -> Result<(), GroupError> {
        if self.is_complete() {
            return Ok(());
        }
        let failed = self
            .failed()
            .map(|(identity, err)| (identity.clone(), err.to_string()))
            .collect();
        Err(GroupError::PartialAccessRemoval { failed })
    }
}

/// Single authority over one user's tickets, local and remote.
pub struct GroupManager<S: Storage, E: Environment> {
    key_pair: Arc<LocalKeyPair>,
    own_card: Card,
    local: LocalTicketStore<S>,
    cloud: CloudTicketStore,
    lookup: Arc<LookupManager<S>>,
    config: GroupConfig,
    env: E,
    sessions: Mutex<HashMap<SessionId, SessionSlot>>,
}

impl<S: Storage, E: Environment> GroupManager<S, E> {
    /// Manager for `key_pair`'s identity.
    ///
    /// # Errors
    ///
    /// - `Config`: `config` is invalid or `cloud` acts as another identity
    pub fn new(
        key_pair: Arc<LocalKeyPair>,
        storage: S,
        cloud: Arc<dyn KeyValueCloud>,
        lookup: Arc<LookupManager<S>>,
        config: GroupConfig,
        env: E,
    ) -> Result<Self, GroupError> {
        config.validate()?;
        if cloud.identity() != key_pair.identity() {
            return Err(GroupError::Config(format!(
                "cloud client acts as {}, key pair belongs to {}",
                cloud.identity(),
                key_pair.identity()
            )));
        }

        Ok(Self {
            own_card: key_pair.card(env.wall_clock_secs()),
            local: LocalTicketStore::new(storage, config.max_tickets_in_group),
            cloud: CloudTicketStore::new(cloud, key_pair.verifying_key()),
            key_pair,
            lookup,
            config,
            env,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Own identity.
    pub fn identity(&self) -> &Identity {
        self.key_pair.identity()
    }

    /// Card for the caller's own key.
    pub fn own_card(&self) -> &Card {
        &self.own_card
    }

    /// Active configuration.
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub(crate) fn key_pair(&self) -> &LocalKeyPair {
        &self.key_pair
    }

    pub(crate) fn lookup_manager(&self) -> &LookupManager<S> {
        &self.lookup
    }

    pub(crate) fn env(&self) -> &E {
        &self.env
    }

    /// Counter bumped by every local write to the session. Lets caches
    /// detect that a held group no longer matches local state.
    #[allow(clippy::expect_used)]
    pub fn generation(&self, session_id: &SessionId) -> u64 {
        self.sessions
            .lock()
            .expect("Mutex poisoned")
            .get(session_id)
            .map_or(0, |slot| slot.generation)
    }

    /// Create a session: push the epoch-0 ticket, then store it locally.
    ///
    /// Nothing is written locally if the push fails.
    ///
    /// # Errors
    ///
    /// - `InvalidGroup`: the caller already has tickets for this session
    /// - `Cloud`: the push failed
    pub async fn store(
        self: &Arc<Self>,
        ticket: Ticket,
        shared_with: &[Card],
    ) -> Result<Group<S, E>, GroupError> {
        let session_id = ticket.session_id();
        let _guard = self.lock(&session_id).await;

        if !self.cloud.epochs(&session_id, self.identity()).await?.is_empty() {
            return Err(GroupError::InvalidGroup(format!(
                "session {} already exists",
                session_id.short()
            )));
        }

        self.cloud.store(&ticket, shared_with).await?;

        let raw = RawGroup::new(GroupInfo { initiator: self.identity().clone() }, vec![ticket])?;
        self.local.store_group(&raw)?;
        self.bump(&session_id);

        info!(session = %session_id.short(), participants = shared_with.len() + 1, "created group");
        Group::from_raw(raw, Arc::clone(self))
    }

    /// Append a new epoch: push, then store locally.
    ///
    /// The ticket must directly follow the latest epoch stored both locally
    /// and in the cloud, so a stale handle can never overwrite an epoch.
    ///
    /// # Errors
    ///
    /// - `MissingCachedGroup`: no local tickets for the session
    /// - `GroupIsOutdated`: a newer epoch exists; update and retry
    /// - `Cloud`: the push failed
    pub async fn store_epoch(
        &self,
        ticket: &Ticket,
        shared_with: &[Card],
    ) -> Result<(), GroupError> {
        let session_id = ticket.session_id();
        let _guard = self.lock(&session_id).await;

        let stored = self.latest_local(&session_id)?.epoch();
        let base = ticket.epoch().saturating_sub(1);
        if ticket.epoch() == 0 || stored != base {
            return Err(GroupError::GroupIsOutdated { message_epoch: stored, current_epoch: base });
        }
        let pushed = match self.cloud.epochs(&session_id, self.identity()).await {
            Ok(epochs) => epochs.last().copied(),
            Err(CloudError::NotFound { .. }) => None,
            Err(err) => return Err(err.into()),
        };
        if let Some(pushed) = pushed
            && pushed >= ticket.epoch()
        {
            let epoch = ticket.epoch();
            warn!(session = %session_id.short(), pushed, epoch, "epoch already pushed");
            return Err(GroupError::GroupIsOutdated { message_epoch: pushed, current_epoch: base });
        }

        self.cloud.store(ticket, shared_with).await?;
        self.local.store_ticket(ticket)?;
        self.bump(&session_id);

        info!(session = %session_id.short(), epoch = ticket.epoch(), "stored epoch");
        Ok(())
    }

    /// Synchronize the session from `from`'s cloud tickets and rebuild it.
    ///
    /// Fetches the cloud epochs missing locally, limited to the retention
    /// window, and always re-fetches the latest so its participant set is
    /// current.
    ///
    /// # Errors
    ///
    /// - `GroupWasNotFound`: `from` shares no tickets for this session with
    ///   the caller; local state for the session is dropped
    /// - `Cloud`: transport, access or verification failure
    pub async fn pull(
        self: &Arc<Self>,
        session_id: &SessionId,
        from: &Card,
    ) -> Result<Group<S, E>, GroupError> {
        let _guard = self.lock(session_id).await;

        let cloud_epochs = match self.cloud.epochs(session_id, from.identity()).await {
            Ok(epochs) => epochs,
            Err(CloudError::NotFound { .. }) => BTreeSet::new(),
            Err(err) => return Err(err.into()),
        };

        let Some(&latest) = cloud_epochs.last() else {
            self.local.delete(session_id)?;
            self.bump(session_id);
            info!(session = %session_id.short(), from = %from.identity(), "group gone from cloud");
            return Err(GroupError::GroupWasNotFound);
        };

        let local_epochs = self.local.epochs(session_id)?;
        let window: BTreeSet<u32> =
            cloud_epochs.iter().rev().take(self.config.max_tickets_in_group).copied().collect();

        // A chain that ends below ours, or comes from another initiator, was
        // recreated under the same identifier.
        let mut replace = local_epochs.last().is_none_or(|local| *local > latest)
            || self
                .local
                .retrieve_info(session_id)?
                .is_some_and(|info| &info.initiator != from.identity());

        // Newest epoch held on both sides; its key must match or the chain
        // was replaced underneath us.
        let shared = local_epochs.iter().rev().find(|epoch| cloud_epochs.contains(epoch)).copied();

        let mut to_fetch: BTreeSet<u32> = if replace {
            window.clone()
        } else {
            window.difference(&local_epochs).copied().collect()
        };
        to_fetch.insert(latest);
        to_fetch.extend(shared.filter(|_| !replace));
        let mut tickets = self.fetch(session_id, from, &to_fetch).await?;

        if !replace
            && let Some(shared) = shared
            && let Some(stored) = self.local.retrieve_ticket(session_id, shared)?
        {
            let fetched = tickets.iter().find(|ticket| ticket.epoch() == shared);
            if fetched.is_some_and(|ticket| ticket.message() != stored.message()) {
                warn!(session = %session_id.short(), shared, "cloud chain diverged, replacing");
                replace = true;
                tickets = self.fetch(session_id, from, &window).await?;
            }
        }

        let raw = if replace {
            let raw = RawGroup::new(GroupInfo { initiator: from.identity().clone() }, tickets)?;
            self.local.store_group(&raw)?;
            raw
        } else {
            self.local.store_tickets(&tickets)?;
            match self.local.retrieve_group(session_id, self.config.max_tickets_in_group) {
                LocalLookup::Found(raw) => raw,
                LocalLookup::Absent => return Err(GroupError::GroupWasNotFound),
                LocalLookup::Corrupt(err) => {
                    error!(
                        session = %session_id.short(),
                        error = %err,
                        "local group unreadable after append"
                    );
                    return Err(GroupError::GroupWasNotFound);
                },
            }
        };
        self.bump(session_id);

        debug!(session = %session_id.short(), replaced = replace, latest, "pulled group");
        Group::from_raw(raw, Arc::clone(self))
    }

    async fn fetch(
        &self,
        session_id: &SessionId,
        from: &Card,
        epochs: &BTreeSet<u32>,
    ) -> Result<Vec<Ticket>, GroupError> {
        match self.cloud.retrieve(session_id, from, epochs).await {
            Ok(tickets) => Ok(tickets),
            Err(CloudError::NotFound { .. }) => Err(GroupError::GroupWasNotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Grant `cards` access to every existing epoch of the caller's session.
    pub async fn add_access(
        &self,
        cards: &[Card],
        session_id: &SessionId,
    ) -> Result<(), GroupError> {
        let _guard = self.lock(session_id).await;
        self.cloud.add_recipients(cards, session_id).await?;
        debug!(session = %session_id.short(), added = cards.len(), "granted access");
        Ok(())
    }

    /// Re-grant `card` access under its current key.
    pub async fn re_add_access(
        &self,
        card: &Card,
        session_id: &SessionId,
    ) -> Result<(), GroupError> {
        let _guard = self.lock(session_id).await;
        self.cloud.re_add_recipient(card, session_id).await?;
        debug!(session = %session_id.short(), identity = %card.identity(), "re-granted access");
        Ok(())
    }

    /// Revoke each identity's access to every epoch, one cloud call each.
    ///
    /// Never short-circuits: every identity is attempted and its outcome
    /// recorded. An identity that already had no access counts as removed.
    pub async fn remove_access(
        &self,
        identities: &[Identity],
        session_id: &SessionId,
    ) -> AccessRemoval {
        let _guard = self.lock(session_id).await;

        let mut removal = AccessRemoval::default();
        for identity in identities {
            let outcome = match self.cloud.remove_recipient(identity, session_id).await {
                Ok(()) | Err(CloudError::RecipientNotFound { .. }) => Ok(()),
                Err(err) => {
                    warn!(
                        session = %session_id.short(),
                        %identity,
                        error = %err,
                        "access removal failed"
                    );
                    Err(err)
                },
            };
            removal.outcomes.insert(identity.clone(), outcome);
        }
        removal
    }

    /// Grant `cards` access to every epoch and record `participants` on the
    /// latest local ticket, as one step under the session lock.
    ///
    /// # Errors
    ///
    /// - `MissingCachedGroup`: no local tickets for the session
    /// - `GroupIsOutdated`: the latest stored epoch is not `epoch`
    /// - `Cloud`: the grant failed; nothing is written locally
    pub async fn add_participants(
        &self,
        cards: &[Card],
        session_id: &SessionId,
        epoch: u32,
        participants: BTreeSet<Identity>,
    ) -> Result<(), GroupError> {
        let _guard = self.lock(session_id).await;

        let latest = self.latest_at(session_id, epoch)?;
        self.cloud.add_recipients(cards, session_id).await?;
        self.local.store_ticket(&latest.with_participants(participants))?;
        self.bump(session_id);

        debug!(session = %session_id.short(), added = cards.len(), "granted access");
        Ok(())
    }

    /// Rewrite the local copy of the latest ticket with `participants`.
    ///
    /// # Errors
    ///
    /// - `MissingCachedGroup`: no local tickets for the session
    /// - `GroupIsOutdated`: the latest stored epoch is not `epoch`
    pub async fn update_latest_participants(
        &self,
        session_id: &SessionId,
        epoch: u32,
        participants: BTreeSet<Identity>,
    ) -> Result<(), GroupError> {
        let _guard = self.lock(session_id).await;

        let latest = self.latest_at(session_id, epoch)?;
        self.local.store_ticket(&latest.with_participants(participants))?;
        self.bump(session_id);
        Ok(())
    }

    /// Local group, `None` on absence or any read failure.
    pub async fn retrieve(self: &Arc<Self>, session_id: &SessionId) -> Option<Group<S, E>> {
        lenient(session_id, self.lookup(session_id).await)
    }

    /// Local group holding only `epoch`, `None` on absence or any read
    /// failure.
    pub async fn retrieve_epoch(
        self: &Arc<Self>,
        session_id: &SessionId,
        epoch: u32,
    ) -> Option<Group<S, E>> {
        let _guard = self.lock(session_id).await;
        lenient(session_id, self.build(self.local.retrieve_group_at(session_id, epoch)))
    }

    /// Local group, distinguishing absence from corruption.
    pub async fn lookup(
        self: &Arc<Self>,
        session_id: &SessionId,
    ) -> LocalLookup<Group<S, E>, GroupError> {
        let _guard = self.lock(session_id).await;
        self.build(self.local.retrieve_group(session_id, self.config.max_tickets_in_group))
    }

    /// Delete the session from the cloud, then locally.
    ///
    /// Both halves are always attempted.
    ///
    /// # Errors
    ///
    /// - `DeleteIncomplete`: both halves failed
    /// - `Cloud` / `LocalStore`: exactly one half failed
    pub async fn delete(&self, session_id: &SessionId) -> Result<(), GroupError> {
        let _guard = self.lock(session_id).await;

        let cloud = self.cloud.delete(session_id).await;
        let local = self.local.delete(session_id);
        self.bump(session_id);

        match (cloud, local) {
            (Ok(()), Ok(())) => {
                info!(session = %session_id.short(), "deleted group");
                Ok(())
            },
            (Err(cloud), Err(local)) => {
                error!(session = %session_id.short(), %cloud, %local, "group delete failed");
                Err(GroupError::DeleteIncomplete {
                    cloud: cloud.to_string(),
                    local: local.to_string(),
                })
            },
            (Err(cloud), Ok(())) => {
                error!(session = %session_id.short(), error = %cloud, "cloud delete failed");
                Err(cloud.into())
            },
            (Ok(()), Err(local)) => {
                error!(session = %session_id.short(), error = %local, "local delete failed");
                Err(local.into())
            },
        }
    }

    /// Drop every locally stored session. Cloud state is untouched.
    #[allow(clippy::expect_used)]
    pub fn reset_local(&self) -> Result<(), GroupError> {
        self.local.reset()?;
        for slot in self.sessions.lock().expect("Mutex poisoned").values_mut() {
            slot.generation += 1;
        }
        info!("reset local group state");
        Ok(())
    }

    fn latest_local(&self, session_id: &SessionId) -> Result<Ticket, GroupError> {
        self.local.retrieve_last(1, session_id)?.pop().ok_or(GroupError::MissingCachedGroup)
    }

    fn latest_at(&self, session_id: &SessionId, epoch: u32) -> Result<Ticket, GroupError> {
        let latest = self.latest_local(session_id)?;
        if latest.epoch() != epoch {
            return Err(GroupError::GroupIsOutdated {
                message_epoch: latest.epoch(),
                current_epoch: epoch,
            });
        }
        Ok(latest)
    }

    // Callers hold the session lock, so the group's generation matches the
    // state it was read from.
    fn build(
        self: &Arc<Self>,
        found: LocalLookup<RawGroup>,
    ) -> LocalLookup<Group<S, E>, GroupError> {
        match found {
            LocalLookup::Found(raw) => match Group::from_raw(raw, Arc::clone(self)) {
                Ok(group) => LocalLookup::Found(group),
                Err(err) => LocalLookup::Corrupt(err),
            },
            LocalLookup::Absent => LocalLookup::Absent,
            LocalLookup::Corrupt(err) => LocalLookup::Corrupt(err.into()),
        }
    }

    #[allow(clippy::expect_used)]
    async fn lock(&self, session_id: &SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut sessions = self.sessions.lock().expect("Mutex poisoned");
            Arc::clone(&sessions.entry(*session_id).or_default().lock)
        };
        lock.lock_owned().await
    }

    #[allow(clippy::expect_used)]
    fn bump(&self, session_id: &SessionId) {
        let mut sessions = self.sessions.lock().expect("Mutex poisoned");
        sessions.entry(*session_id).or_default().generation += 1;
    }
}

fn lenient<T>(session_id: &SessionId, found: LocalLookup<T, GroupError>) -> Option<T> {
    match found {
        LocalLookup::Found(value) => Some(value),
        LocalLookup::Absent => None,
        LocalLookup::Corrupt(err) => {
            warn!(session = %session_id.short(), error = %err, "local group unreadable");
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::{
        cloud::MemoryCloud,
        env::SeededEnv,
        lookup::MemoryDirectory,
        storage::{MemoryStorage, StorageOp},
    };

    struct Peer {
        key_pair: LocalKeyPair,
        storage: MemoryStorage,
        manager: Arc<GroupManager<MemoryStorage, SeededEnv>>,
    }

    fn peer(cloud: &MemoryCloud, directory: &MemoryDirectory, name: &str, seed: u8) -> Peer {
        peer_with(cloud, directory, name, seed, GroupConfig::default())
    }

    fn peer_with(
        cloud: &MemoryCloud,
        directory: &MemoryDirectory,
        name: &str,
        seed: u8,
        config: GroupConfig,
    ) -> Peer {
        let key_pair =
            LocalKeyPair::from_signing_key(name.into(), SigningKey::from_bytes(&[seed; 32]));
        directory.publish(key_pair.card(0));
        let storage = MemoryStorage::new();
        let lookup =
            Arc::new(LookupManager::new(Arc::new(directory.clone()), storage.clone(), &config));
        let manager = GroupManager::new(
            Arc::new(key_pair.clone()),
            storage.clone(),
            Arc::new(cloud.client(key_pair.clone())),
            lookup,
            config,
            SeededEnv::new(u64::from(seed), 0),
        )
        .unwrap();
        Peer { key_pair, storage, manager: Arc::new(manager) }
    }

    fn session() -> SessionId {
        SessionId::derive(b"manager-test-session").unwrap()
    }

    fn first_ticket(names: &[&str]) -> Ticket {
        let participants = names.iter().map(|name| Identity::from(*name)).collect();
        let limits = GroupConfig::default().participant_limits;
        Ticket::create(session(), participants, [7; 32], limits).unwrap()
    }

    fn next_ticket(group: &Group<MemoryStorage, SeededEnv>, names: &[&str], key: u8) -> Ticket {
        let participants = names.iter().map(|name| Identity::from(*name)).collect();
        let limits = GroupConfig::default().participant_limits;
        Ticket::next(group.session(), participants, [key; 32], limits).unwrap()
    }

    async fn create_pair(alice: &Peer, bob: &Peer) -> Group<MemoryStorage, SeededEnv> {
        let shared = [bob.key_pair.card(0)];
        alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await.unwrap()
    }

    #[tokio::test]
    async fn store_then_pull() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);

        let created = alice
            .manager
            .store(first_ticket(&["alice", "bob"]), &[bob.key_pair.card(0)])
            .await
            .unwrap();
        assert_eq!(created.epoch(), 0);

        let pulled = bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();
        assert_eq!(pulled.participants(), created.participants());
        assert_eq!(pulled.initiator(), &Identity::from("alice"));
        assert!(bob.manager.retrieve(&session()).await.is_some());
    }

    #[tokio::test]
    async fn failed_push_writes_nothing_locally() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);

        cloud.set_offline(true);
        let shared = [bob.key_pair.card(0)];
        let result = alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await;
        assert!(matches!(result, Err(GroupError::Cloud(CloudError::Transport(_)))));
        assert_eq!(alice.storage.file_count(), 0);
    }

    #[tokio::test]
    async fn second_store_of_same_session_is_rejected() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);
        let shared = [bob.key_pair.card(0)];

        alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await.unwrap();
        let again = alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await;
        assert!(matches!(again, Err(GroupError::InvalidGroup(_))));
    }

    #[tokio::test]
    async fn pull_appends_new_epochs() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);
        let shared = [bob.key_pair.card(0)];

        let group = alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await.unwrap();
        bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();

        let ticket = next_ticket(&group, &["alice", "bob"], 8);
        alice.manager.store_epoch(&ticket, &shared).await.unwrap();

        let pulled = bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();
        assert_eq!(pulled.epoch(), 1);
        assert_eq!(pulled.session().epoch_count(), 2);
    }

    #[tokio::test]
    async fn store_epoch_requires_direct_successor() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);
        let shared = [bob.key_pair.card(0)];

        let group = alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await.unwrap();
        let ticket = next_ticket(&group, &["alice", "bob"], 8);
        alice.manager.store_epoch(&ticket, &shared).await.unwrap();
        let values = cloud.value_count();

        let replay = next_ticket(&group, &["alice", "bob"], 9);
        let replay = alice.manager.store_epoch(&replay, &shared).await;
        assert!(matches!(
            replay,
            Err(GroupError::GroupIsOutdated { message_epoch: 1, current_epoch: 0 })
        ));
        assert_eq!(cloud.value_count(), values);

        let pulled = bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();
        assert_eq!(pulled.epoch(), 1);
        assert!(pulled.participants().contains(&Identity::from("bob")));
    }

    #[tokio::test]
    async fn participant_rewrite_checks_epoch() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);
        let shared = [bob.key_pair.card(0)];

        let group = alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await.unwrap();
        let ticket = next_ticket(&group, &["alice", "bob"], 8);
        alice.manager.store_epoch(&ticket, &shared).await.unwrap();

        let participants = BTreeSet::from(["alice".into(), "bob".into(), "carol".into()]);
        let result = alice.manager.update_latest_participants(&session(), 0, participants).await;
        assert!(matches!(
            result,
            Err(GroupError::GroupIsOutdated { message_epoch: 1, current_epoch: 0 })
        ));
        assert_eq!(alice.manager.retrieve(&session()).await.unwrap().participants().len(), 2);
    }

    #[tokio::test]
    async fn pull_replaces_recreated_group() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);
        let shared = [bob.key_pair.card(0)];

        let group = alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await.unwrap();
        let ticket = next_ticket(&group, &["alice", "bob"], 8);
        alice.manager.store_epoch(&ticket, &shared).await.unwrap();
        assert_eq!(bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap().epoch(), 1);

        alice.manager.delete(&session()).await.unwrap();
        alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await.unwrap();

        let pulled = bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();
        assert_eq!(pulled.epoch(), 0);
        assert_eq!(pulled.session().epoch_count(), 1);
    }

    #[tokio::test]
    async fn pull_replaces_diverged_chain_at_same_epoch() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);
        let shared = [bob.key_pair.card(0)];

        let group = alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await.unwrap();
        let ticket = next_ticket(&group, &["alice", "bob"], 8);
        alice.manager.store_epoch(&ticket, &shared).await.unwrap();
        bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();

        alice.manager.delete(&session()).await.unwrap();
        let group = alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await.unwrap();
        let ticket = next_ticket(&group, &["alice", "bob"], 9);
        alice.manager.store_epoch(&ticket, &shared).await.unwrap();
        let current = alice.manager.retrieve(&session()).await.unwrap();

        let pulled = bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();
        assert_eq!(pulled.epoch(), 1);
        let sealed = current.encrypt(b"recreated").unwrap();
        let opened = pulled.decrypt(&sealed, &alice.key_pair.card(0), None).await.unwrap();
        assert_eq!(opened, b"recreated");
    }

    #[tokio::test]
    async fn pull_is_idempotent() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);

        create_pair(&alice, &bob).await;

        let first = bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();
        let second = bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();
        assert_eq!(first.participants(), second.participants());
        assert_eq!(first.session().epoch_count(), second.session().epoch_count());
    }

    #[tokio::test]
    async fn pull_without_access_drops_local_state() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);

        create_pair(&alice, &bob).await;
        bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();

        let removal = alice.manager.remove_access(&["bob".into()], &session()).await;
        assert!(removal.is_complete());

        let result = bob.manager.pull(&session(), &alice.key_pair.card(0)).await;
        assert!(matches!(result, Err(GroupError::GroupWasNotFound)));
        assert!(bob.manager.retrieve(&session()).await.is_none());
    }

    #[tokio::test]
    async fn pull_respects_retention_window() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let config = GroupConfig { max_tickets_in_group: 2, ..GroupConfig::default() };
        let alice = peer_with(&cloud, &directory, "alice", 1, config);
        let bob = peer_with(&cloud, &directory, "bob", 2, config);
        let shared = [bob.key_pair.card(0)];

        let mut group =
            alice.manager.store(first_ticket(&["alice", "bob"]), &shared).await.unwrap();
        for key in 10..14 {
            let ticket = next_ticket(&group, &["alice", "bob"], key);
            alice.manager.store_epoch(&ticket, &shared).await.unwrap();
            group = alice.manager.retrieve(&session()).await.unwrap();
        }

        let pulled = bob.manager.pull(&session(), &alice.key_pair.card(0)).await.unwrap();
        assert_eq!(pulled.epoch(), 4);
        assert_eq!(pulled.session().first_epoch(), Some(3));
    }

    #[tokio::test]
    async fn lookup_reports_corruption() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);

        create_pair(&alice, &bob).await;

        let dir = format!("groups/{}/TICKETS", session().to_hex());
        alice.storage.apply(&[StorageOp::put(dir, "0", Vec::new())]).unwrap();

        assert!(matches!(alice.manager.lookup(&session()).await, LocalLookup::Corrupt(_)));
        assert!(alice.manager.retrieve(&session()).await.is_none());
        assert!(matches!(
            alice.manager.lookup(&SessionId::derive(b"some-other-session").unwrap()).await,
            LocalLookup::Absent
        ));
    }

    #[tokio::test]
    async fn partial_access_removal_is_reported() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);

        create_pair(&alice, &bob).await;

        let removal =
            alice.manager.remove_access(&["bob".into(), "alice".into()], &session()).await;
        assert!(!removal.is_complete());
        assert_eq!(removal.outcomes()[&Identity::from("bob")], Ok(()));

        let Err(GroupError::PartialAccessRemoval { failed }) = removal.into_result() else {
            unreachable!("owner cannot lose access to its own values");
        };
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, Identity::from("alice"));
    }

    #[tokio::test]
    async fn delete_reports_each_failing_half() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);

        create_pair(&alice, &bob).await;

        cloud.set_offline(true);
        let result = alice.manager.delete(&session()).await;
        assert!(matches!(result, Err(GroupError::Cloud(CloudError::Transport(_)))));
        assert!(alice.manager.retrieve(&session()).await.is_none());

        cloud.set_offline(false);
        alice.manager.delete(&session()).await.unwrap();
        assert_eq!(cloud.value_count(), 0);
    }

    #[tokio::test]
    async fn local_writes_bump_generation() {
        let (cloud, directory) = (MemoryCloud::new(), MemoryDirectory::new());
        let alice = peer(&cloud, &directory, "alice", 1);
        let bob = peer(&cloud, &directory, "bob", 2);

        assert_eq!(alice.manager.generation(&session()), 0);
        create_pair(&alice, &bob).await;
        let after_store = alice.manager.generation(&session());
        assert!(after_store > 0);

        let participants = BTreeSet::from(["alice".into(), "bob".into()]);
        alice.manager.update_latest_participants(&session(), 0, participants).await.unwrap();
        assert!(alice.manager.generation(&session()) > after_store);

        let before_reset = alice.manager.generation(&session());
        alice.manager.reset_local().unwrap();
        assert!(alice.manager.generation(&session()) > before_reset);
        assert!(alice.manager.retrieve(&session()).await.is_none());
    }

    #[tokio::test]
    async fn mismatched_cloud_identity_is_rejected() {
        let cloud = MemoryCloud::new();
        let alice =
            LocalKeyPair::from_signing_key("alice".into(), SigningKey::from_bytes(&[1; 32]));
        let bob = LocalKeyPair::from_signing_key("bob".into(), SigningKey::from_bytes(&[2; 32]));
        let storage = MemoryStorage::new();
        let lookup = Arc::new(LookupManager::new(
            Arc::new(MemoryDirectory::new()),
            storage.clone(),
            &GroupConfig::default(),
        ));

        let result = GroupManager::new(
            Arc::new(alice),
            storage,
            Arc::new(cloud.client(bob)),
            lookup,
            GroupConfig::default(),
            SeededEnv::new(0, 0),
        );
        assert!(matches!(result, Err(GroupError::Config(_))));
    }
}
