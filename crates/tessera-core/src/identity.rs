//! Identities, cards and the caller's own key pair.
//!
//! A [`Card`] binds an identity to an Ed25519 public key. Rotating a key
//! produces a new card that links back to the one it supersedes, so a
//! message signed before a rotation can still be attributed by walking the
//! chain to the card that was current at the time.

use std::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{env::Environment, lookup::LookupError};

/// User identity (an opaque, caller-assigned name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Wrap an identity string.
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(identity: &str) -> Self {
        Self::new(identity)
    }
}

/// Signed identity record binding an identity to a public key.
///
/// Immutable. `previous` links to the card this one superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    identity: Identity,
    public_key: VerifyingKey,
    created_at: u64,
    previous: Option<Box<Card>>,
}

impl Card {
    /// First card for an identity.
    pub fn new(identity: Identity, public_key: VerifyingKey, created_at: u64) -> Self {
        Self { identity, public_key, created_at, previous: None }
    }

    /// Card superseding this one with a new key.
    pub fn rotate(&self, public_key: VerifyingKey, created_at: u64) -> Self {
        Self {
            identity: self.identity.clone(),
            public_key,
            created_at,
            previous: Some(Box::new(self.clone())),
        }
    }

    /// Identity this card belongs to.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Verifying key published by this card.
    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    /// Creation time, seconds since the Unix epoch.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The card this one superseded.
    pub fn previous(&self) -> Option<&Card> {
        self.previous.as_deref()
    }

    /// This card followed by every card it superseded, newest first.
    pub fn history(&self) -> CardHistory<'_> {
        CardHistory { next: Some(self) }
    }

    /// Card that was current at `date`.
    ///
    /// Walks the chain newest first and stops at the first card with
    /// `created_at <= date`. If every card is newer than `date`, the oldest
    /// card is returned. At most `max_depth` cards are visited.
    ///
    /// # Errors
    ///
    /// - `CardChainTooDeep`: no decision within `max_depth` cards
    pub fn as_of(&self, date: u64, max_depth: usize) -> Result<&Card, LookupError> {
        let mut oldest = self;
        for (visited, card) in self.history().enumerate() {
            if visited >= max_depth {
                return Err(LookupError::CardChainTooDeep { max_depth });
            }
            if card.created_at <= date {
                return Ok(card);
            }
            oldest = card;
        }
        Ok(oldest)
    }
}

/// Iterator over a card chain, newest first.
///
/// Terminates at the first card without a predecessor.
pub struct CardHistory<'a> {
    next: Option<&'a Card>,
}

impl<'a> Iterator for CardHistory<'a> {
    type Item = &'a Card;

    fn next(&mut self) -> Option<Self::Item> {
        let card = self.next?;
        self.next = card.previous();
        Some(card)
    }
}

/// The caller's own identity and signing key.
#[derive(Clone)]
pub struct LocalKeyPair {
    identity: Identity,
    signing_key: SigningKey,
}

impl LocalKeyPair {
    /// Generate a fresh key pair from the environment's RNG.
    pub fn generate<E: Environment>(identity: Identity, env: &E) -> Self {
        let mut seed: [u8; 32] = env.random_array();
        let signing_key = SigningKey::from_bytes(&seed);
        seed.fill(0);
        Self { identity, signing_key }
    }

    /// Wrap an existing signing key.
    pub fn from_signing_key(identity: Identity, signing_key: SigningKey) -> Self {
        Self { identity, signing_key }
    }

    /// Own identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Signing key for outgoing messages and cloud values.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Public half of the signing key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Card publishing this key pair.
    pub fn card(&self, created_at: u64) -> Card {
        Card::new(self.identity.clone(), self.verifying_key(), created_at)
    }
}

impl fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("identity", &self.identity)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}
