//! Card discovery with a local cache.
//!
//! [`LookupManager`] resolves identities to their current [`Card`] through a
//! [`CardDirectory`] and keeps every resolved card in the local [`Storage`]
//! namespace, so decrypting and re-deriving recipients work offline once a
//! peer has been seen.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::{
    config::GroupConfig,
    identity::{Card, Identity},
    storage::{Storage, StorageError},
};

/// Directory of cached cards inside the storage namespace
const CARDS_DIR: &str = "cards";

/// Errors from card lookup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// Directory has no card for the identity
    #[error("card not found for {identity}")]
    CardNotFound {
        /// Identity that was searched
        identity: Identity,
    },

    /// Directory returned more than one card for the identity
    #[error("duplicate cards for {identity}")]
    DuplicateCards {
        /// Identity with several current cards
        identity: Identity,
    },

    /// No cached card and the lookup was cache-only
    #[error("no cached card for {identity}")]
    MissingCachedCard {
        /// Identity that was looked up
        identity: Identity,
    },

    /// Lookup called with no identities
    #[error("no identities to look up")]
    MissingIdentities,

    /// Historical key resolution exceeded the card chain depth cap
    #[error("card chain deeper than {max_depth}")]
    CardChainTooDeep {
        /// Depth cap that was hit
        max_depth: usize,
    },

    /// Directory service failure
    #[error("directory error: {0}")]
    Directory(String),

    /// Card cache failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Source of current cards (the identity service).
#[async_trait]
pub trait CardDirectory: Send + Sync {
    /// Current cards for `identities`. Unknown identities are omitted.
    async fn search_cards(&self, identities: &[Identity]) -> Result<Vec<Card>, LookupError>;
}

/// In-process card directory for tests and simulations.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    cards: Arc<Mutex<BTreeMap<Identity, Card>>>,
}

impl MemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `card` as its identity's current card, replacing any older one.
    #[allow(clippy::expect_used)]
    pub fn publish(&self, card: Card) {
        self.cards.lock().expect("Mutex poisoned").insert(card.identity().clone(), card);
    }

    /// Current card for `identity`.
    #[allow(clippy::expect_used)]
    pub fn current(&self, identity: &Identity) -> Option<Card> {
        self.cards.lock().expect("Mutex poisoned").get(identity).cloned()
    }
}

#[async_trait]
impl CardDirectory for MemoryDirectory {
    #[allow(clippy::expect_used)]
    async fn search_cards(
        &self,
        identities: &[Identity],
    ) -> Result<Vec<Card>, LookupError> {
        let cards = self.cards.lock().expect("Mutex poisoned");
        Ok(identities.iter().filter_map(|identity| cards.get(identity).cloned()).collect())
    }
}

/// Identity to card resolution with a persistent local cache.
pub struct LookupManager<S: Storage> {
    directory: Arc<dyn CardDirectory>,
    storage: S,
    max_search_count: usize,
}

impl<S: Storage> LookupManager<S> {
    /// Manager searching `directory` and caching in `storage`.
    pub fn new(directory: Arc<dyn CardDirectory>, storage: S, config: &GroupConfig) -> Self {
        Self { directory, storage, max_search_count: config.max_search_count.max(1) }
    }

    /// Cards for every identity, from the cache unless `force_reload`.
    ///
    /// # Errors
    ///
    /// - `MissingIdentities`: `identities` is empty
    /// - `CardNotFound`: the directory has no card for an identity
    /// - `DuplicateCards`: the directory returned several cards for one
    pub async fn lookup_cards(
        &self,
        identities: &[Identity],
        force_reload: bool,
    ) -> Result<BTreeMap<Identity, Card>, LookupError> {
        if identities.is_empty() {
            return Err(LookupError::MissingIdentities);
        }

        let wanted: BTreeSet<&Identity> = identities.iter().collect();
        let mut found = BTreeMap::new();
        let mut to_fetch = Vec::new();

        for identity in &wanted {
            match self.cached(identity)? {
                Some(card) if !force_reload => {
                    found.insert((*identity).clone(), card);
                },
                _ => to_fetch.push((*identity).clone()),
            }
        }

        for chunk in to_fetch.chunks(self.max_search_count) {
            let mut fetched: BTreeMap<Identity, Card> = BTreeMap::new();
            for card in self.directory.search_cards(chunk).await? {
                if !chunk.contains(card.identity()) {
                    continue;
                }
                if fetched.contains_key(card.identity()) {
                    return Err(LookupError::DuplicateCards { identity: card.identity().clone() });
                }
                fetched.insert(card.identity().clone(), card);
            }

            for card in fetched.values() {
                self.store(card)?;
            }
            found.extend(fetched);
        }

        if let Some(missing) = wanted.iter().find(|identity| !found.contains_key(**identity)) {
            return Err(LookupError::CardNotFound { identity: (*missing).clone() });
        }

        debug!(requested = wanted.len(), fetched = to_fetch.len(), "resolved cards");
        Ok(found)
    }

    /// Card for one identity, from the cache unless `force_reload`.
    pub async fn lookup_card(
        &self,
        identity: &Identity,
        force_reload: bool,
    ) -> Result<Card, LookupError> {
        let mut cards = self.lookup_cards(std::slice::from_ref(identity), force_reload).await?;
        cards
            .remove(identity)
            .ok_or_else(|| LookupError::CardNotFound { identity: identity.clone() })
    }

    /// Cached card only; never touches the directory.
    ///
    /// # Errors
    ///
    /// - `MissingCachedCard`: identity has not been resolved before
    pub fn lookup_cached_card(&self, identity: &Identity) -> Result<Card, LookupError> {
        self.cached(identity)?
            .ok_or_else(|| LookupError::MissingCachedCard { identity: identity.clone() })
    }

    /// Forget every cached card.
    pub fn reset(&self) -> Result<(), LookupError> {
        self.storage.delete_dir(CARDS_DIR)?;
        Ok(())
    }

    fn cached(&self, identity: &Identity) -> Result<Option<Card>, LookupError> {
        let Some(bytes) = self.storage.read(CARDS_DIR, &cache_name(identity))? else {
            return Ok(None);
        };
        let card = ciborium::from_reader(bytes.as_slice())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(card))
    }

    fn store(&self, card: &Card) -> Result<(), LookupError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(card, &mut bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.storage.write(CARDS_DIR, &cache_name(card.identity()), &bytes)?;
        Ok(())
    }
}

/// Identities may contain `/`, so cache files are named by hex.
fn cache_name(identity: &Identity) -> String {
    use std::fmt::Write;

    identity.as_str().bytes().fold(String::new(), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::storage::MemoryStorage;

    fn card(name: &str, seed: u8, created_at: u64) -> Card {
        Card::new(name.into(), SigningKey::from_bytes(&[seed; 32]).verifying_key(), created_at)
    }

    fn manager(directory: &MemoryDirectory) -> LookupManager<MemoryStorage> {
        let config = GroupConfig::default();
        LookupManager::new(Arc::new(directory.clone()), MemoryStorage::new(), &config)
    }

    #[tokio::test]
    async fn lookup_caches_cards() {
        let directory = MemoryDirectory::new();
        directory.publish(card("bob", 2, 0));
        let lookup = manager(&directory);

        assert!(matches!(
            lookup.lookup_cached_card(&"bob".into()),
            Err(LookupError::MissingCachedCard { .. })
        ));

        let fetched = lookup.lookup_card(&"bob".into(), false).await.unwrap();
        assert_eq!(lookup.lookup_cached_card(&"bob".into()).unwrap(), fetched);
    }

    #[tokio::test]
    async fn cache_wins_unless_forced() {
        let directory = MemoryDirectory::new();
        let original = card("bob", 2, 0);
        directory.publish(original.clone());
        let lookup = manager(&directory);
        lookup.lookup_card(&"bob".into(), false).await.unwrap();

        let rotated = original.rotate(SigningKey::from_bytes(&[3; 32]).verifying_key(), 10);
        directory.publish(rotated.clone());

        assert_eq!(lookup.lookup_card(&"bob".into(), false).await.unwrap(), original);
        assert_eq!(lookup.lookup_card(&"bob".into(), true).await.unwrap(), rotated);
        assert_eq!(lookup.lookup_cached_card(&"bob".into()).unwrap(), rotated);
    }

    #[tokio::test]
    async fn unknown_identity_is_not_found() {
        let directory = MemoryDirectory::new();
        directory.publish(card("bob", 2, 0));
        let lookup = manager(&directory);

        let result = lookup.lookup_cards(&["bob".into(), "mallory".into()], false).await;
        assert_eq!(result, Err(LookupError::CardNotFound { identity: "mallory".into() }));
    }

    #[tokio::test]
    async fn empty_request_is_rejected() {
        let lookup = manager(&MemoryDirectory::new());
        assert_eq!(lookup.lookup_cards(&[], false).await, Err(LookupError::MissingIdentities));
    }

    #[tokio::test]
    async fn duplicate_cards_are_rejected() {
        struct Doubling;

        #[async_trait]
        impl CardDirectory for Doubling {
            async fn search_cards(
                &self,
                identities: &[Identity],
            ) -> Result<Vec<Card>, LookupError> {
                Ok(identities
                    .iter()
                    .flat_map(|i| [card(i.as_str(), 1, 0), card(i.as_str(), 2, 0)])
                    .collect())
            }
        }

        let lookup =
            LookupManager::new(Arc::new(Doubling), MemoryStorage::new(), &GroupConfig::default());
        let result = lookup.lookup_card(&"bob".into(), false).await;
        assert!(matches!(result, Err(LookupError::DuplicateCards { .. })));
    }

    #[tokio::test]
    async fn searches_in_chunks() {
        let directory = MemoryDirectory::new();
        let names: Vec<Identity> = (0..7).map(|i| Identity::new(format!("user-{i}"))).collect();
        for (i, name) in names.iter().enumerate() {
            directory.publish(card(name.as_str(), i as u8, 0));
        }
        let config = GroupConfig { max_search_count: 3, ..GroupConfig::default() };
        let lookup = LookupManager::new(Arc::new(directory), MemoryStorage::new(), &config);

        assert_eq!(lookup.lookup_cards(&names, false).await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn reset_forgets_cards() {
        let directory = MemoryDirectory::new();
        directory.publish(card("a/b", 2, 0));
        let lookup = manager(&directory);
        lookup.lookup_card(&"a/b".into(), false).await.unwrap();

        lookup.reset().unwrap();
        assert!(lookup.lookup_cached_card(&"a/b".into()).is_err());
    }

    #[test]
    fn cache_names_are_path_safe() {
        assert_eq!(cache_name(&"a/b".into()), "612f62");
    }
}
