//! Live group session.
//!
//! A [`Group`] is the folded view of one session's local ticket window. It
//! encrypts and decrypts offline. Membership changes and refreshes go
//! through the [`GroupManager`], which keeps cloud and local state in step.
//!
//! Every mutation builds its result first and only then updates `self`, so
//! a failed call leaves the group as it was.

use std::{collections::BTreeSet, sync::Arc};

use ed25519_dalek::VerifyingKey;
use tessera_crypto::{CryptoError, GroupMessage, GroupSession, SessionId};
use tracing::{debug, info};

use crate::{
    cloud::CloudError,
    env::Environment,
    error::GroupError,
    identity::{Card, Identity},
    manager::GroupManager,
    storage::Storage,
    ticket::{RawGroup, Ticket},
};

/// One group conversation as seen by the local user.
#[derive(Clone)]
pub struct Group<S: Storage, E: Environment> {
    session_id: SessionId,
    initiator: Identity,
    participants: BTreeSet<Identity>,
    session: GroupSession,
    manager: Arc<GroupManager<S, E>>,
    generation: u64,
}

impl<S: Storage, E: Environment> Group<S, E> {
    /// Fold a stored group into a live session.
    ///
    /// The group remembers the manager's generation for its session at this
    /// point, so build it while the session lock is held.
    ///
    /// # Errors
    ///
    /// - `InvalidGroup`: tickets are empty, gapped or from several sessions
    /// - `InvalidParticipantsCount`: latest participant set out of bounds
    pub fn from_raw(raw: RawGroup, manager: Arc<GroupManager<S, E>>) -> Result<Self, GroupError> {
        let session = GroupSession::from_tickets(raw.tickets.iter().map(Ticket::message))
            .map_err(|e| GroupError::InvalidGroup(e.to_string()))?;
        let (Some(session_id), Some(latest)) = (session.session_id(), raw.latest()) else {
            return Err(GroupError::InvalidGroup("group has no tickets".into()));
        };

        let participants = latest.participants().clone();
        manager.config().participant_limits.validate(participants.len())?;

        let generation = manager.generation(&session_id);

        Ok(Self {
            session_id,
            initiator: raw.info.initiator,
            participants,
            session,
            manager,
            generation,
        })
    }

    /// Session this group belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Identity that created the group and owns its tickets.
    pub fn initiator(&self) -> &Identity {
        &self.initiator
    }

    /// Participants of the latest epoch, initiator included.
    pub fn participants(&self) -> &BTreeSet<Identity> {
        &self.participants
    }

    /// Highest folded epoch.
    pub fn epoch(&self) -> u32 {
        self.session.current_epoch().unwrap_or_default()
    }

    /// Folded cryptographic session.
    pub fn session(&self) -> &GroupSession {
        &self.session
    }

    /// Manager generation this group was built at.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Sign and encrypt under the current epoch. Never touches the network.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, GroupError> {
        let message = self.session.encrypt(
            data,
            self.manager.key_pair().signing_key(),
            self.manager.env().random_array(),
        )?;
        Ok(message.to_bytes()?)
    }

    /// Decrypt a message from `sender`.
    ///
    /// With `date`, the sender's key is the one its card chain held at that
    /// time; otherwise the card's current key.
    ///
    /// # Errors
    ///
    /// - `InvalidGroup`: `data` is not a group message
    /// - `MessageNotFromThisGroup`: message belongs to another session
    /// - `GroupIsOutdated`: message epoch is newer; call [`Self::update`]
    /// - `MissingCachedGroup`: message epoch is older than the local window
    ///   and no longer stored
    /// - `VerificationFailed`: authentication or signature check failed
    pub async fn decrypt(
        &self,
        data: &[u8],
        sender: &Card,
        date: Option<u64>,
    ) -> Result<Vec<u8>, GroupError> {
        let message =
            GroupMessage::from_bytes(data).map_err(|e| GroupError::InvalidGroup(e.to_string()))?;
        if message.session_id != self.session_id {
            return Err(GroupError::MessageNotFromThisGroup);
        }

        let current_epoch = self.epoch();
        if message.epoch > current_epoch {
            return Err(GroupError::GroupIsOutdated { message_epoch: message.epoch, current_epoch });
        }

        let verifier = self.sender_key(sender, date)?;

        if self.session.has_epoch(message.epoch) {
            return open(&self.session, &message, &verifier);
        }

        let historical = self
            .manager
            .retrieve_epoch(&self.session_id, message.epoch)
            .await
            .ok_or(GroupError::MissingCachedGroup)?;
        debug!(
            session = %self.session_id.short(),
            epoch = message.epoch,
            "decrypting from evicted epoch"
        );
        open(&historical.session, &message, &verifier)
    }

    /// Pull the latest tickets from the initiator and replace this session.
    ///
    /// Retries once with a freshly fetched initiator card if the tickets do
    /// not verify under the cached one.
    pub async fn update(&mut self) -> Result<(), GroupError> {
        let initiator = self.initiator_card(false).await?;
        let refreshed = match self.manager.pull(&self.session_id, &initiator).await {
            Err(GroupError::Cloud(CloudError::VerificationFailed)) => {
                let initiator = self.initiator_card(true).await?;
                self.manager.pull(&self.session_id, &initiator).await?
            },
            result => result?,
        };

        debug!(session = %self.session_id.short(), epoch = refreshed.epoch(), "updated group");
        *self = refreshed;
        Ok(())
    }

    /// Grant `cards` access to the whole ticket chain. No new epoch is
    /// minted, so new participants can read history.
    ///
    /// # Errors
    ///
    /// - `GroupPermissionDenied`: caller is not the initiator
    /// - `InvalidChangeParticipants`: every card is already a participant
    /// - `InvalidParticipantsCount`: the group would grow past the maximum
    /// - `GroupIsOutdated`: a newer epoch exists; update and retry
    pub async fn add(&mut self, cards: &[Card]) -> Result<(), GroupError> {
        self.check_initiator()?;

        let mut participants = self.participants.clone();
        participants.extend(cards.iter().map(|card| card.identity().clone()));
        if participants == self.participants {
            return Err(GroupError::InvalidChangeParticipants);
        }
        self.manager.config().participant_limits.validate(participants.len())?;

        let added: Vec<Card> = cards
            .iter()
            .filter(|card| !self.participants.contains(card.identity()))
            .cloned()
            .collect();
        self.manager
            .add_participants(&added, &self.session_id, self.epoch(), participants.clone())
            .await?;

        info!(session = %self.session_id.short(), added = added.len(), "added participants");
        self.participants = participants;
        Ok(())
    }

    /// Remove participants: mint a new epoch without them, then revoke their
    /// access to every earlier epoch.
    ///
    /// If revocation partially fails the new epoch is still in place and the
    /// error names the identities that kept access to history.
    ///
    /// # Errors
    ///
    /// - `GroupPermissionDenied`: caller is not the initiator
    /// - `InvalidChangeParticipants`: no card is a participant, or one is the
    ///   initiator
    /// - `InvalidParticipantsCount`: the group would shrink below the minimum
    /// - `GroupIsOutdated`: a newer epoch exists; update and retry
    /// - `PartialAccessRemoval`: some identities kept access to old epochs
    pub async fn remove(&mut self, cards: &[Card]) -> Result<(), GroupError> {
        self.check_initiator()?;

        let removed: BTreeSet<Identity> = cards
            .iter()
            .map(|card| card.identity().clone())
            .filter(|identity| self.participants.contains(identity))
            .collect();
        if removed.is_empty() || removed.contains(&self.initiator) {
            return Err(GroupError::InvalidChangeParticipants);
        }

        let participants: BTreeSet<Identity> =
            self.participants.difference(&removed).cloned().collect();
        let limits = self.manager.config().participant_limits;
        limits.validate(participants.len())?;

        let remaining: Vec<Identity> = participants
            .iter()
            .filter(|identity| *identity != self.manager.identity())
            .cloned()
            .collect();
        let recipients: Vec<Card> = self
            .manager
            .lookup_manager()
            .lookup_cards(&remaining, false)
            .await?
            .into_values()
            .collect();

        let key = self.manager.env().random_array();
        let ticket = Ticket::next(&self.session, participants.clone(), key, limits)?;
        let mut session = self.session.clone();
        session.add_epoch(ticket.message())?;

        self.manager.store_epoch(&ticket, &recipients).await?;
        info!(
            session = %self.session_id.short(),
            epoch = ticket.epoch(),
            removed = removed.len(),
            "removed participants"
        );
        self.session = session;
        self.participants = participants;

        let removed: Vec<Identity> = removed.into_iter().collect();
        self.manager.remove_access(&removed, &self.session_id).await.into_result()
    }

    /// Strip and re-grant a participant's access under its current card,
    /// after a key rotation. No new epoch is minted.
    ///
    /// # Errors
    ///
    /// - `GroupPermissionDenied`: caller is not the initiator
    /// - `InvalidChangeParticipants`: card's identity is not a participant
    pub async fn re_add(&self, card: &Card) -> Result<(), GroupError> {
        self.check_initiator()?;
        if !self.participants.contains(card.identity()) || card.identity() == &self.initiator {
            return Err(GroupError::InvalidChangeParticipants);
        }

        self.manager.re_add_access(card, &self.session_id).await
    }

    fn check_initiator(&self) -> Result<(), GroupError> {
        if self.manager.identity() != &self.initiator {
            return Err(GroupError::GroupPermissionDenied);
        }
        Ok(())
    }

    fn sender_key(&self, sender: &Card, date: Option<u64>) -> Result<VerifyingKey, GroupError> {
        let card = match date {
            Some(date) => sender.as_of(date, self.manager.config().max_card_chain_depth)?,
            None => sender,
        };
        Ok(*card.public_key())
    }

    async fn initiator_card(&self, force_reload: bool) -> Result<Card, GroupError> {
        if &self.initiator == self.manager.identity() {
            return Ok(self.manager.own_card().clone());
        }
        Ok(self.manager.lookup_manager().lookup_card(&self.initiator, force_reload).await?)
    }
}

impl<S: Storage, E: Environment> std::fmt::Debug for Group<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("session_id", &self.session_id)
            .field("initiator", &self.initiator)
            .field("participants", &self.participants)
            .field("epoch", &self.epoch())
            .finish_non_exhaustive()
    }
}

fn open(
    session: &GroupSession,
    message: &GroupMessage,
    verifier: &VerifyingKey,
) -> Result<Vec<u8>, GroupError> {
    session.decrypt(message, verifier).map_err(|err| match err {
        CryptoError::DecryptionFailed { .. } | CryptoError::InvalidSignature => {
            GroupError::VerificationFailed
        },
        CryptoError::SessionMismatch { .. } => GroupError::MessageNotFromThisGroup,
        CryptoError::EpochNotFound { .. } => GroupError::MissingCachedGroup,
        other => GroupError::Crypto(other),
    })
}
