#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use super::{CloudError, KeyValueCloud, PulledValue, ValueAddress, ValueHash};
use crate::identity::{Card, Identity, LocalKeyPair};

/// In-process cloud key-value service for tests and simulations
///
/// Enforces the same rules as the hosted service: only owners write, only
/// access-listed identities read, and a recipient whose key has rotated
/// since being granted is refused until re-granted. Every value is signed by
/// its owner and checked against the reader's verifier keys on pull.
///
/// Clones share state. Uses `lock().expect()`, which panics if the mutex is
/// poisoned - acceptable for test code.
#[derive(Clone, Default)]
pub struct MemoryCloud {
    inner: Arc<Mutex<BTreeMap<(Identity, ValueAddress), Entry>>>,
    offline: Arc<AtomicBool>,
}

struct Entry {
    data: Vec<u8>,
    signature: Signature,
    access: BTreeMap<Identity, VerifyingKey>,
    version: u64,
}

impl Entry {
    fn hash(&self) -> ValueHash {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_be_bytes());
        hasher.update(&self.data);
        ValueHash(hasher.finalize().into())
    }
}

impl MemoryCloud {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Client acting as `key_pair`'s identity.
    pub fn client(&self, key_pair: LocalKeyPair) -> MemoryCloudClient {
        MemoryCloudClient { cloud: self.clone(), key_pair }
    }

    /// While offline, every call fails with `Transport`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// All keys under `owner`'s `root/path`, ignoring access lists.
    pub fn keys(&self, owner: &Identity, root: &str, path: &str) -> BTreeSet<String> {
        self.entries()
            .keys()
            .filter(|(o, a)| o == owner && a.root == root && a.path == path)
            .map(|(_, a)| a.key.clone())
            .collect()
    }

    /// Access list of one value.
    pub fn access_list(
        &self,
        owner: &Identity,
        address: &ValueAddress,
    ) -> Option<BTreeSet<Identity>> {
        self.entries()
            .get(&(owner.clone(), address.clone()))
            .map(|entry| entry.access.keys().cloned().collect())
    }

    /// Number of stored values.
    pub fn value_count(&self) -> usize {
        self.entries().len()
    }

    #[allow(clippy::expect_used)]
    fn entries(&self) -> MutexGuard<'_, BTreeMap<(Identity, ValueAddress), Entry>> {
        self.inner.lock().expect("Mutex poisoned")
    }

    fn check_online(&self) -> Result<(), CloudError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CloudError::Transport("service unreachable".to_string()));
        }
        Ok(())
    }
}

/// [`KeyValueCloud`] client bound to one identity of a [`MemoryCloud`].
#[derive(Clone)]
pub struct MemoryCloudClient {
    cloud: MemoryCloud,
    key_pair: LocalKeyPair,
}

impl MemoryCloudClient {
    fn me(&self) -> &Identity {
        self.key_pair.identity()
    }

    fn matches(
        &self,
        owner: &Identity,
        address: &ValueAddress,
        root: &str,
        path: &str,
        key: Option<&str>,
    ) -> bool {
        owner == self.me()
            && address.root == root
            && address.path == path
            && key.is_none_or(|k| address.key == k)
    }
}

#[async_trait]
impl KeyValueCloud for MemoryCloudClient {
    fn identity(&self) -> &Identity {
        self.key_pair.identity()
    }

    async fn push_value(
        &self,
        address: &ValueAddress,
        data: &[u8],
        recipients: &[Card],
        previous_hash: Option<ValueHash>,
    ) -> Result<ValueHash, CloudError> {
        self.cloud.check_online()?;
        let mut entries = self.cloud.entries();
        let slot = (self.me().clone(), address.clone());

        let existing = entries.get(&slot);
        if let Some(expected) = previous_hash {
            match existing {
                Some(entry) if entry.hash() == expected => {},
                Some(_) => return Err(CloudError::HashMismatch),
                None => return Err(CloudError::NotFound { path: address.path.clone() }),
            }
        }

        let mut access: BTreeMap<Identity, VerifyingKey> = recipients
            .iter()
            .map(|card| (card.identity().clone(), *card.public_key()))
            .collect();
        access.insert(self.me().clone(), self.key_pair.verifying_key());

        let entry = Entry {
            data: data.to_vec(),
            signature: self.key_pair.signing_key().sign(data),
            access,
            version: existing.map_or(0, |e| e.version + 1),
        };
        let hash = entry.hash();
        entries.insert(slot, entry);

        Ok(hash)
    }

    async fn pull_value(
        &self,
        owner: &Identity,
        address: &ValueAddress,
        verifiers: &[VerifyingKey],
    ) -> Result<PulledValue, CloudError> {
        self.cloud.check_online()?;
        let entries = self.cloud.entries();
        let entry = entries
            .get(&(owner.clone(), address.clone()))
            .ok_or_else(|| CloudError::NotFound { path: address.path.clone() })?;

        match entry.access.get(self.me()) {
            None => {
                return Err(CloudError::AccessDenied {
                    reason: format!("{} is not a recipient", self.me()),
                });
            },
            Some(granted) if *granted != self.key_pair.verifying_key() => {
                return Err(CloudError::AccessDenied {
                    reason: format!("{} was granted under a superseded key", self.me()),
                });
            },
            Some(_) => {},
        }

        if !verifiers.iter().any(|key| key.verify(&entry.data, &entry.signature).is_ok()) {
            return Err(CloudError::VerificationFailed);
        }

        Ok(PulledValue {
            value: entry.data.clone(),
            identities: entry.access.keys().cloned().collect(),
            hash: entry.hash(),
        })
    }

    async fn get_keys(
        &self,
        owner: &Identity,
        root: &str,
        path: &str,
    ) -> Result<BTreeSet<String>, CloudError> {
        self.cloud.check_online()?;
        let entries = self.cloud.entries();

        Ok(entries
            .iter()
            .filter(|((o, a), entry)| {
                o == owner
                    && a.root == root
                    && a.path == path
                    && entry.access.contains_key(self.me())
            })
            .map(|((_, a), _)| a.key.clone())
            .collect())
    }

    async fn update_recipients(
        &self,
        address: &ValueAddress,
        value: &[u8],
        previous_hash: ValueHash,
        new_recipients: &[Card],
    ) -> Result<(), CloudError> {
        self.cloud.check_online()?;
        let mut entries = self.cloud.entries();
        let entry = entries
            .get_mut(&(self.me().clone(), address.clone()))
            .ok_or_else(|| CloudError::NotFound { path: address.path.clone() })?;

        if entry.hash() != previous_hash || entry.data != value {
            return Err(CloudError::HashMismatch);
        }

        for card in new_recipients {
            entry.access.insert(card.identity().clone(), *card.public_key());
        }
        entry.signature = self.key_pair.signing_key().sign(&entry.data);
        entry.version += 1;

        Ok(())
    }

    async fn delete_recipient(
        &self,
        identity: &Identity,
        root: &str,
        path: &str,
        key: Option<&str>,
    ) -> Result<(), CloudError> {
        self.cloud.check_online()?;
        if identity == self.me() {
            return Err(CloudError::AccessDenied {
                reason: "owner cannot be removed from its own values".to_string(),
            });
        }

        let mut entries = self.cloud.entries();
        let mut found = false;
        for ((owner, address), entry) in entries.iter_mut() {
            if self.matches(owner, address, root, path, key)
                && entry.access.remove(identity).is_some()
            {
                entry.version += 1;
                found = true;
            }
        }

        if !found {
            return Err(CloudError::RecipientNotFound { identity: identity.clone() });
        }
        Ok(())
    }

    async fn reset_value(
        &self,
        root: &str,
        path: &str,
        key: Option<&str>,
    ) -> Result<(), CloudError> {
        self.cloud.check_online()?;
        let mut entries = self.cloud.entries();
        entries.retain(|(owner, address), _| !self.matches(owner, address, root, path, key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;

    fn pair(name: &str, seed: u8) -> LocalKeyPair {
        LocalKeyPair::from_signing_key(name.into(), SigningKey::from_bytes(&[seed; 32]))
    }

    fn addr(key: &str) -> ValueAddress {
        ValueAddress::new("root", "path", key)
    }

    #[tokio::test]
    async fn recipients_can_pull_outsiders_cannot() {
        let cloud = MemoryCloud::new();
        let (alice, bob, eve) = (pair("alice", 1), pair("bob", 2), pair("eve", 3));
        let owner = cloud.client(alice.clone());

        owner.push_value(&addr("0"), b"ticket", &[bob.card(0)], None).await.unwrap();

        let pulled = cloud
            .client(bob)
            .pull_value(alice.identity(), &addr("0"), &[alice.verifying_key()])
            .await
            .unwrap();
        assert_eq!(pulled.value, b"ticket");
        assert_eq!(pulled.identities, BTreeSet::from(["alice".into(), "bob".into()]));

        let eve_client = cloud.client(eve);
        let addr0 = addr("0");
        let alice_verifiers = [alice.verifying_key()];
        let denied = eve_client.pull_value(alice.identity(), &addr0, &alice_verifiers);
        assert!(matches!(denied.await, Err(CloudError::AccessDenied { .. })));
    }

    #[tokio::test]
    async fn wrong_verifier_fails_pull() {
        let cloud = MemoryCloud::new();
        let (alice, bob) = (pair("alice", 1), pair("bob", 2));
        cloud
            .client(alice.clone())
            .push_value(&addr("0"), b"x", &[bob.card(0)], None)
            .await
            .unwrap();

        let result = cloud
            .client(bob.clone())
            .pull_value(alice.identity(), &addr("0"), &[bob.verifying_key()])
            .await;
        assert_eq!(result, Err(CloudError::VerificationFailed));
    }

    #[tokio::test]
    async fn rotated_recipient_needs_regrant() {
        let cloud = MemoryCloud::new();
        let alice = pair("alice", 1);
        let old_bob = pair("bob", 2);
        let new_bob = pair("bob", 4);
        let owner = cloud.client(alice.clone());
        owner.push_value(&addr("0"), b"x", &[old_bob.card(0)], None).await.unwrap();

        let verifiers = [alice.verifying_key()];
        let new_bob_client = cloud.client(new_bob.clone());
        let addr0 = addr("0");
        let stale = new_bob_client.pull_value(alice.identity(), &addr0, &verifiers);
        assert!(matches!(stale.await, Err(CloudError::AccessDenied { .. })));

        let current = owner.pull_value(alice.identity(), &addr("0"), &verifiers).await.unwrap();
        owner
            .update_recipients(&addr("0"), &current.value, current.hash, &[new_bob.card(1)])
            .await
            .unwrap();

        let regranted_client = cloud.client(new_bob);
        let regranted = regranted_client.pull_value(alice.identity(), &addr0, &verifiers);
        assert!(regranted.await.is_ok());
    }

    #[tokio::test]
    async fn update_recipients_checks_hash() {
        let cloud = MemoryCloud::new();
        let (alice, bob) = (pair("alice", 1), pair("bob", 2));
        let owner = cloud.client(alice);
        let hash = owner.push_value(&addr("0"), b"v1", &[], None).await.unwrap();
        owner.push_value(&addr("0"), b"v2", &[], None).await.unwrap();

        let result = owner.update_recipients(&addr("0"), b"v2", hash, &[bob.card(0)]).await;
        assert_eq!(result, Err(CloudError::HashMismatch));
    }

    #[tokio::test]
    async fn get_keys_filters_by_access() {
        let cloud = MemoryCloud::new();
        let (alice, bob) = (pair("alice", 1), pair("bob", 2));
        let owner = cloud.client(alice.clone());
        owner.push_value(&addr("0"), b"a", &[bob.card(0)], None).await.unwrap();
        owner.push_value(&addr("1"), b"b", &[], None).await.unwrap();

        let bob_keys = cloud.client(bob).get_keys(alice.identity(), "root", "path").await.unwrap();
        assert_eq!(bob_keys, BTreeSet::from(["0".to_string()]));
        assert_eq!(cloud.keys(alice.identity(), "root", "path").len(), 2);
    }

    #[tokio::test]
    async fn delete_recipient_scopes_and_reports_missing() {
        let cloud = MemoryCloud::new();
        let (alice, bob, carol) = (pair("alice", 1), pair("bob", 2), pair("carol", 3));
        let owner = cloud.client(alice.clone());
        owner.push_value(&addr("0"), b"a", &[bob.card(0)], None).await.unwrap();
        owner.push_value(&addr("1"), b"b", &[bob.card(0)], None).await.unwrap();

        owner.delete_recipient(bob.identity(), "root", "path", Some("0")).await.unwrap();
        assert_eq!(
            cloud.access_list(alice.identity(), &addr("0")),
            Some(BTreeSet::from(["alice".into()]))
        );
        assert!(cloud.access_list(alice.identity(), &addr("1")).unwrap().contains(bob.identity()));

        owner.delete_recipient(bob.identity(), "root", "path", None).await.unwrap();
        let missing = owner.delete_recipient(carol.identity(), "root", "path", None).await;
        assert!(matches!(missing, Err(CloudError::RecipientNotFound { .. })));
        assert!(owner.delete_recipient(alice.identity(), "root", "path", None).await.is_err());
    }

    #[tokio::test]
    async fn reset_is_owner_scoped_and_idempotent() {
        let cloud = MemoryCloud::new();
        let (alice, bob) = (pair("alice", 1), pair("bob", 2));
        cloud.client(alice.clone()).push_value(&addr("0"), b"a", &[], None).await.unwrap();
        cloud.client(bob.clone()).push_value(&addr("0"), b"b", &[], None).await.unwrap();

        cloud.client(alice.clone()).reset_value("root", "path", None).await.unwrap();
        cloud.client(alice).reset_value("root", "path", None).await.unwrap();

        assert_eq!(cloud.value_count(), 1);
        assert_eq!(cloud.keys(bob.identity(), "root", "path").len(), 1);
    }

    #[tokio::test]
    async fn offline_fails_every_call() {
        let cloud = MemoryCloud::new();
        let alice = pair("alice", 1);
        let client = cloud.client(alice.clone());
        cloud.set_offline(true);

        let push = client.push_value(&addr("0"), b"a", &[], None).await;
        assert!(matches!(push, Err(CloudError::Transport(_))));
        assert!(client.get_keys(alice.identity(), "root", "path").await.is_err());

        cloud.set_offline(false);
        assert!(client.push_value(&addr("0"), b"a", &[], None).await.is_ok());
    }
}
