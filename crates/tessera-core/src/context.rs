//! Per-user entry point.
//!
//! A [`UserSession`] starts [`UserSession::Uninitialized`] and becomes
//! [`UserSession::Ready`] once a private key is established. Only a ready
//! session hands out a [`GroupContext`], so group operations cannot run
//! without a key.
//!
//! The context caches live groups per session id. A cached group is served
//! only while the manager's generation counter for its session is unchanged;
//! any local write invalidates it.

#![allow(clippy::disallowed_types, reason = "Group cache lock is never held across an await")]

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, RwLock},
};

use tessera_crypto::{CryptoError, SessionId};
use tracing::{debug, info};

use crate::{
    cloud::KeyValueCloud,
    config::GroupConfig,
    env::Environment,
    error::GroupError,
    group::Group,
    identity::{Card, Identity, LocalKeyPair},
    lookup::{CardDirectory, LookupManager},
    manager::GroupManager,
    storage::Storage,
    ticket::Ticket,
};

/// Everything a user session needs besides its key.
#[derive(Clone)]
pub struct Dependencies<S: Storage, E: Environment> {
    /// Local persistence shared by tickets and cached cards
    pub storage: S,
    /// Card directory
    pub directory: Arc<dyn CardDirectory>,
    /// Group tuning
    pub config: GroupConfig,
    /// Clock and randomness
    pub env: E,
}

/// User state: with or without an established private key.
pub enum UserSession<S: Storage, E: Environment> {
    /// No private key yet
    Uninitialized(Dependencies<S, E>),
    /// Private key established; groups are usable
    Ready(GroupContext<S, E>),
}

impl<S: Storage, E: Environment> UserSession<S, E> {
    /// Session without a key.
    pub fn new(dependencies: Dependencies<S, E>) -> Self {
        Self::Uninitialized(dependencies)
    }

    /// Establish `key_pair`, acting in the cloud through `cloud`.
    ///
    /// Establishing over an existing key clears all local group state first.
    ///
    /// # Errors
    ///
    /// - `Config`: invalid configuration or mismatched cloud identity
    pub fn establish(
        &mut self,
        key_pair: LocalKeyPair,
        cloud: Arc<dyn KeyValueCloud>,
    ) -> Result<&GroupContext<S, E>, GroupError> {
        self.clear_private_key()?;
        let dependencies = match self {
            Self::Uninitialized(dependencies) => dependencies.clone(),
            Self::Ready(context) => context.dependencies.clone(),
        };

        let context = GroupContext::new(Arc::new(key_pair), cloud, dependencies)?;
        info!(identity = %context.identity(), "private key established");
        *self = Self::Ready(context);
        self.context()
    }

    /// Forget the private key and every piece of local group state.
    pub fn clear_private_key(&mut self) -> Result<(), GroupError> {
        let Self::Ready(context) = self else {
            return Ok(());
        };

        context.wipe()?;
        let dependencies = context.dependencies.clone();
        info!(identity = %context.identity(), "private key cleared");
        *self = Self::Uninitialized(dependencies);
        Ok(())
    }

    /// Group operations for the established key.
    ///
    /// # Errors
    ///
    /// - `MissingPrivateKey`: no key established
    pub fn context(&self) -> Result<&GroupContext<S, E>, GroupError> {
        match self {
            Self::Ready(context) => Ok(context),
            Self::Uninitialized(_) => Err(GroupError::MissingPrivateKey),
        }
    }

    /// Whether a private key is established.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

struct CachedGroup<S: Storage, E: Environment> {
    group: Group<S, E>,
    generation: u64,
}

/// Group operations for one user with an established key.
pub struct GroupContext<S: Storage, E: Environment> {
    manager: Arc<GroupManager<S, E>>,
    lookup: Arc<LookupManager<S>>,
    groups: RwLock<HashMap<SessionId, CachedGroup<S, E>>>,
    dependencies: Dependencies<S, E>,
}

impl<S: Storage, E: Environment> GroupContext<S, E> {
    fn new(
        key_pair: Arc<LocalKeyPair>,
        cloud: Arc<dyn KeyValueCloud>,
        dependencies: Dependencies<S, E>,
    ) -> Result<Self, GroupError> {
        let lookup = Arc::new(LookupManager::new(
            Arc::clone(&dependencies.directory),
            dependencies.storage.clone(),
            &dependencies.config,
        ));
        let manager = GroupManager::new(
            key_pair,
            dependencies.storage.clone(),
            cloud,
            Arc::clone(&lookup),
            dependencies.config,
            dependencies.env.clone(),
        )?;

        Ok(Self {
            manager: Arc::new(manager),
            lookup,
            groups: RwLock::new(HashMap::new()),
            dependencies,
        })
    }

    /// Own identity.
    pub fn identity(&self) -> &Identity {
        self.manager.identity()
    }

    /// Card for the established key.
    pub fn own_card(&self) -> &Card {
        self.manager.own_card()
    }

    /// Underlying group manager.
    pub fn manager(&self) -> &Arc<GroupManager<S, E>> {
        &self.manager
    }

    /// Create a group with the caller as initiator and `users` as the other
    /// participants.
    ///
    /// # Errors
    ///
    /// - `ShortGroupId`: identifier is 10 bytes or shorter
    /// - `InvalidParticipantsCount`: participant count out of bounds
    /// - `InvalidGroup`: the caller already created this session
    pub async fn create_group(
        &self,
        identifier: &[u8],
        users: &[Card],
    ) -> Result<Group<S, E>, GroupError> {
        let session_id = session_id(identifier)?;

        let others: Vec<Card> =
            users.iter().filter(|card| card.identity() != self.identity()).cloned().collect();
        let mut participants: BTreeSet<Identity> =
            others.iter().map(|card| card.identity().clone()).collect();
        participants.insert(self.identity().clone());

        let limits = self.dependencies.config.participant_limits;
        let key = self.dependencies.env.random_array();
        let ticket = Ticket::create(session_id, participants, key, limits)?;

        let group = self.manager.store(ticket, &others).await?;
        self.cache(&group);
        Ok(group)
    }

    /// Fetch a group created by `initiator` from the cloud.
    ///
    /// # Errors
    ///
    /// - `ShortGroupId`: identifier is 10 bytes or shorter
    /// - `GroupWasNotFound`: the initiator shares no such group with the caller
    pub async fn load_group(
        &self,
        identifier: &[u8],
        initiator: &Card,
    ) -> Result<Group<S, E>, GroupError> {
        let session_id = session_id(identifier)?;
        let group = self.manager.pull(&session_id, initiator).await?;
        self.cache(&group);
        Ok(group)
    }

    /// Group from the local cache only. `None` if it has to be loaded.
    ///
    /// # Errors
    ///
    /// - `ShortGroupId`: identifier is 10 bytes or shorter
    #[allow(clippy::expect_used)]
    pub async fn get_group(&self, identifier: &[u8]) -> Result<Option<Group<S, E>>, GroupError> {
        let session_id = session_id(identifier)?;

        let generation = self.manager.generation(&session_id);
        {
            let groups = self.groups.read().expect("RwLock poisoned");
            if let Some(cached) = groups.get(&session_id)
                && cached.generation == generation
            {
                return Ok(Some(cached.group.clone()));
            }
        }

        let Some(group) = self.manager.retrieve(&session_id).await else {
            self.groups.write().expect("RwLock poisoned").remove(&session_id);
            return Ok(None);
        };
        debug!(session = %session_id.short(), "reloaded group from local store");
        self.cache(&group);
        Ok(Some(group))
    }

    /// Delete a group the caller created, everywhere.
    ///
    /// Deleting a group that does not exist locally succeeds.
    ///
    /// # Errors
    ///
    /// - `ShortGroupId`: identifier is 10 bytes or shorter
    /// - `GroupPermissionDenied`: the caller is not the initiator
    #[allow(clippy::expect_used)]
    pub async fn delete_group(&self, identifier: &[u8]) -> Result<(), GroupError> {
        let session_id = session_id(identifier)?;

        if let Some(group) = self.manager.retrieve(&session_id).await
            && group.initiator() != self.identity()
        {
            return Err(GroupError::GroupPermissionDenied);
        }

        self.groups.write().expect("RwLock poisoned").remove(&session_id);
        self.manager.delete(&session_id).await
    }

    /// Cards for `identities`, from the card cache unless `force_reload`.
    pub async fn find_users(
        &self,
        identities: &[Identity],
        force_reload: bool,
    ) -> Result<BTreeMap<Identity, Card>, GroupError> {
        Ok(self.lookup.lookup_cards(identities, force_reload).await?)
    }

    /// Card for one identity, from the card cache unless `force_reload`.
    pub async fn find_user(
        &self,
        identity: &Identity,
        force_reload: bool,
    ) -> Result<Card, GroupError> {
        Ok(self.lookup.lookup_card(identity, force_reload).await?)
    }

    #[allow(clippy::expect_used)]
    fn cache(&self, group: &Group<S, E>) {
        let generation = group.generation();
        self.groups
            .write()
            .expect("RwLock poisoned")
            .insert(group.session_id(), CachedGroup { group: group.clone(), generation });
    }

    #[allow(clippy::expect_used)]
    fn wipe(&self) -> Result<(), GroupError> {
        self.groups.write().expect("RwLock poisoned").clear();
        self.manager.reset_local()?;
        self.lookup.reset()?;
        Ok(())
    }
}

fn session_id(identifier: &[u8]) -> Result<SessionId, GroupError> {
    SessionId::derive(identifier).map_err(|err| match err {
        CryptoError::ShortIdentifier { len, .. } => GroupError::ShortGroupId { len },
        other => GroupError::Crypto(other),
    })
}
