//! Cloud side of ticket persistence.
//!
//! Each ticket's key-exchange message is stored at
//! `group-sessions / hex(session_id) / <epoch>`, owned by whoever minted it
//! and readable by the identities it was shared with. The access list of a
//! pulled value is the ticket's participant set.

use std::{collections::BTreeSet, sync::Arc};

use ed25519_dalek::VerifyingKey;
use tessera_crypto::{SessionId, TicketMessage};
use tracing::debug;

use super::{CloudError, KeyValueCloud, ValueAddress};
use crate::{
    identity::{Card, Identity},
    ticket::Ticket,
};

/// Root namespace of all group ticket values
pub const GROUP_SESSIONS_ROOT: &str = "group-sessions";

/// Ticket persistence against the cloud key-value service.
#[derive(Clone)]
pub struct CloudTicketStore {
    cloud: Arc<dyn KeyValueCloud>,
    own_key: VerifyingKey,
}

impl CloudTicketStore {
    /// Store acting through `cloud`, whose caller signs with the key behind
    /// `own_key`.
    pub fn new(cloud: Arc<dyn KeyValueCloud>, own_key: VerifyingKey) -> Self {
        Self { cloud, own_key }
    }

    /// Identity the store acts as.
    pub fn identity(&self) -> &Identity {
        self.cloud.identity()
    }

    /// Push a ticket readable by `shared_with` and the caller.
    ///
    /// Overwrites blindly: epoch keys are unique, so a duplicate push of the
    /// same ticket is harmless.
    pub async fn store(&self, ticket: &Ticket, shared_with: &[Card]) -> Result<(), CloudError> {
        let data =
            ticket.message().to_bytes().map_err(|e| CloudError::Serialization(e.to_string()))?;
        let address = address(&ticket.session_id(), ticket.epoch());

        self.cloud.push_value(&address, &data, shared_with, None).await?;
        debug!(
            session = %ticket.session_id().short(),
            epoch = ticket.epoch(),
            recipients = shared_with.len(),
            "pushed ticket"
        );
        Ok(())
    }

    /// Epochs of `owner`'s tickets that the caller can read.
    ///
    /// # Errors
    ///
    /// - `InvalidEpochKey`: a stored key is not a `u32`
    pub async fn epochs(
        &self,
        session_id: &SessionId,
        owner: &Identity,
    ) -> Result<BTreeSet<u32>, CloudError> {
        self.cloud
            .get_keys(owner, GROUP_SESSIONS_ROOT, &session_id.to_hex())
            .await?
            .into_iter()
            .map(|key| key.parse::<u32>().map_err(|_| CloudError::InvalidEpochKey { key }))
            .collect()
    }

    /// Pull the given epochs of `owner`'s tickets, ascending, verifying each
    /// against the owner's public key.
    ///
    /// # Errors
    ///
    /// - `VerificationFailed`: a value was not signed by `owner`
    /// - `CorruptTicket`: a value does not decode to the ticket it is
    ///   addressed as
    pub async fn retrieve(
        &self,
        session_id: &SessionId,
        owner: &Card,
        epochs: &BTreeSet<u32>,
    ) -> Result<Vec<Ticket>, CloudError> {
        let mut tickets = Vec::with_capacity(epochs.len());
        for &epoch in epochs {
            let pulled = self
                .cloud
                .pull_value(owner.identity(), &address(session_id, epoch), &[*owner.public_key()])
                .await?;

            let message = TicketMessage::from_bytes(&pulled.value)
                .map_err(|e| CloudError::CorruptTicket { reason: e.to_string() })?;
            if message.session_id() != *session_id || message.epoch() != epoch {
                return Err(CloudError::CorruptTicket {
                    reason: format!(
                        "stored as epoch {epoch} of {}, decodes as epoch {} of {}",
                        session_id.short(),
                        message.epoch(),
                        message.session_id().short()
                    ),
                });
            }

            tickets.push(Ticket::from_parts(message, pulled.identities));
        }

        debug!(
            session = %session_id.short(),
            owner = %owner.identity(),
            count = tickets.len(),
            "pulled tickets"
        );
        Ok(tickets)
    }

    /// Every ticket of `owner`'s the caller can read.
    pub async fn retrieve_all(
        &self,
        session_id: &SessionId,
        owner: &Card,
    ) -> Result<Vec<Ticket>, CloudError> {
        let epochs = self.epochs(session_id, owner.identity()).await?;
        self.retrieve(session_id, owner, &epochs).await
    }

    /// Grant `cards` access to every existing epoch of the caller's session,
    /// keeping the stored ciphertext.
    pub async fn add_recipients(
        &self,
        cards: &[Card],
        session_id: &SessionId,
    ) -> Result<(), CloudError> {
        for epoch in self.epochs(session_id, self.identity()).await? {
            let address = address(session_id, epoch);
            let current = self.cloud.pull_value(self.identity(), &address, &[self.own_key]).await?;
            self.cloud.update_recipients(&address, &current.value, current.hash, cards).await?;
        }
        Ok(())
    }

    /// Strip `card`'s identity from every epoch and grant it again under the
    /// card's current key.
    pub async fn re_add_recipient(
        &self,
        card: &Card,
        session_id: &SessionId,
    ) -> Result<(), CloudError> {
        let path = session_id.to_hex();
        for epoch in self.epochs(session_id, self.identity()).await? {
            let key = epoch.to_string();
            match self
                .cloud
                .delete_recipient(card.identity(), GROUP_SESSIONS_ROOT, &path, Some(&key))
                .await
            {
                Ok(()) | Err(CloudError::RecipientNotFound { .. }) => {},
                Err(err) => return Err(err),
            }

            let address = address(session_id, epoch);
            let current = self.cloud.pull_value(self.identity(), &address, &[self.own_key]).await?;
            self.cloud
                .update_recipients(
                    &address,
                    &current.value,
                    current.hash,
                    std::slice::from_ref(card),
                )
                .await?;
        }
        Ok(())
    }

    /// Remove `identity` from the access list of every epoch.
    pub async fn remove_recipient(
        &self,
        identity: &Identity,
        session_id: &SessionId,
    ) -> Result<(), CloudError> {
        self.cloud
            .delete_recipient(identity, GROUP_SESSIONS_ROOT, &session_id.to_hex(), None)
            .await
    }

    /// Delete every epoch of the caller's session.
    pub async fn delete(&self, session_id: &SessionId) -> Result<(), CloudError> {
        self.cloud.reset_value(GROUP_SESSIONS_ROOT, &session_id.to_hex(), None).await
    }
}

fn address(session_id: &SessionId, epoch: u32) -> ValueAddress {
    ValueAddress::new(GROUP_SESSIONS_ROOT, session_id.to_hex(), epoch.to_string())
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use tessera_crypto::GroupSession;

    use super::*;
    use crate::{cloud::MemoryCloud, config::ParticipantLimits, identity::LocalKeyPair};

    fn pair(name: &str, seed: u8) -> LocalKeyPair {
        LocalKeyPair::from_signing_key(name.into(), SigningKey::from_bytes(&[seed; 32]))
    }

    fn store_for(cloud: &MemoryCloud, pair: &LocalKeyPair) -> CloudTicketStore {
        CloudTicketStore::new(Arc::new(cloud.client(pair.clone())), pair.verifying_key())
    }

    fn session() -> SessionId {
        SessionId::derive(b"cloud-store-session").unwrap()
    }

    fn tickets(len: u32) -> Vec<Ticket> {
        let limits = ParticipantLimits::default();
        let members: BTreeSet<Identity> = ["alice".into(), "bob".into()].into_iter().collect();
        let first = Ticket::create(session(), members.clone(), [0; 32], limits).unwrap();
        let mut folded = GroupSession::from_tickets([first.message()]).unwrap();
        let mut out = vec![first];
        for epoch in 1..len {
            let next = Ticket::next(&folded, members.clone(), [epoch as u8; 32], limits).unwrap();
            folded.add_epoch(next.message()).unwrap();
            out.push(next);
        }
        out
    }

    #[tokio::test]
    async fn store_then_retrieve_as_recipient() {
        let cloud = MemoryCloud::new();
        let (alice, bob) = (pair("alice", 1), pair("bob", 2));
        let alice_store = store_for(&cloud, &alice);
        for ticket in tickets(3) {
            alice_store.store(&ticket, &[bob.card(0)]).await.unwrap();
        }

        let bob_store = store_for(&cloud, &bob);
        let pulled = bob_store.retrieve_all(&session(), &alice.card(0)).await.unwrap();

        assert_eq!(pulled.iter().map(Ticket::epoch).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(
            pulled[0].participants(),
            &BTreeSet::from([Identity::from("alice"), Identity::from("bob")])
        );
        assert_eq!(pulled[2].message(), tickets(3)[2].message());
    }

    #[tokio::test]
    async fn verification_failure_propagates() {
        let cloud = MemoryCloud::new();
        let (alice, bob) = (pair("alice", 1), pair("bob", 2));
        store_for(&cloud, &alice).store(&tickets(1)[0], &[bob.card(0)]).await.unwrap();

        let impostor = Card::new("alice".into(), bob.verifying_key(), 0);
        let result = store_for(&cloud, &bob).retrieve_all(&session(), &impostor).await;

        assert_eq!(result, Err(CloudError::VerificationFailed));
    }

    #[tokio::test]
    async fn add_recipients_grants_history() {
        let cloud = MemoryCloud::new();
        let (alice, bob, carol) = (pair("alice", 1), pair("bob", 2), pair("carol", 3));
        let alice_store = store_for(&cloud, &alice);
        for ticket in tickets(2) {
            alice_store.store(&ticket, &[bob.card(0)]).await.unwrap();
        }

        let carol_store = store_for(&cloud, &carol);
        assert!(carol_store.epochs(&session(), alice.identity()).await.unwrap().is_empty());

        alice_store.add_recipients(&[carol.card(0)], &session()).await.unwrap();

        let pulled = carol_store.retrieve_all(&session(), &alice.card(0)).await.unwrap();
        assert_eq!(pulled.len(), 2);
        assert!(pulled[0].participants().contains(carol.identity()));
    }

    #[tokio::test]
    async fn re_add_recipient_uses_new_key() {
        let cloud = MemoryCloud::new();
        let alice = pair("alice", 1);
        let old_bob = pair("bob", 2);
        let new_bob = pair("bob", 9);
        let alice_store = store_for(&cloud, &alice);
        for ticket in tickets(2) {
            alice_store.store(&ticket, &[old_bob.card(0)]).await.unwrap();
        }

        let new_bob_store = store_for(&cloud, &new_bob);
        let stale = new_bob_store.retrieve_all(&session(), &alice.card(0)).await;
        assert!(matches!(stale, Err(CloudError::AccessDenied { .. })));

        let rotated = old_bob.card(0).rotate(new_bob.verifying_key(), 10);
        alice_store.re_add_recipient(&rotated, &session()).await.unwrap();

        assert_eq!(new_bob_store.retrieve_all(&session(), &alice.card(0)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn remove_recipient_revokes_every_epoch() {
        let cloud = MemoryCloud::new();
        let (alice, bob) = (pair("alice", 1), pair("bob", 2));
        let alice_store = store_for(&cloud, &alice);
        for ticket in tickets(3) {
            alice_store.store(&ticket, &[bob.card(0)]).await.unwrap();
        }

        alice_store.remove_recipient(bob.identity(), &session()).await.unwrap();

        let bob_store = store_for(&cloud, &bob);
        assert!(bob_store.epochs(&session(), alice.identity()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_session_path() {
        let cloud = MemoryCloud::new();
        let (alice, bob) = (pair("alice", 1), pair("bob", 2));
        let alice_store = store_for(&cloud, &alice);
        alice_store.store(&tickets(1)[0], &[bob.card(0)]).await.unwrap();

        alice_store.delete(&session()).await.unwrap();
        alice_store.delete(&session()).await.unwrap();

        assert_eq!(cloud.value_count(), 0);
    }

    #[tokio::test]
    async fn mismatched_ticket_is_corrupt() {
        let cloud = MemoryCloud::new();
        let (alice, bob) = (pair("alice", 1), pair("bob", 2));
        let client = cloud.client(alice.clone());
        let epoch_one = tickets(2)[1].message().to_bytes().unwrap();
        client
            .push_value(&address(&session(), 0), &epoch_one, &[bob.card(0)], None)
            .await
            .unwrap();

        let result = store_for(&cloud, &bob).retrieve_all(&session(), &alice.card(0)).await;
        assert!(matches!(result, Err(CloudError::CorruptTicket { .. })));
    }
}
