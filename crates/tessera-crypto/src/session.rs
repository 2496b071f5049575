//! Group session built by folding tickets in epoch order

use std::{collections::BTreeMap, fmt};

use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::{
    CryptoError, EPOCH_KEY_SIZE, GroupMessage, NONCE_RANDOM_SIZE, SessionId, TicketMessage,
    derive_message_key,
    encryption::{open, seal},
};

/// Live group session state for one session id.
///
/// Holds a contiguous window of epochs. The first folded ticket may carry any
/// epoch (the local window can start after older epochs were evicted); every
/// later ticket must carry exactly the next epoch and the same session id.
#[derive(Clone, Default)]
pub struct GroupSession {
    session_id: Option<SessionId>,
    epochs: BTreeMap<u32, TicketMessage>,
}

impl GroupSession {
    /// Empty session. Fold at least one ticket before encrypting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an ordered sequence of tickets into a fresh session.
    ///
    /// # Errors
    ///
    /// - `EmptySession`: no tickets supplied
    /// - `SessionMismatch` / `EpochGap`: see [`Self::add_epoch`]
    pub fn from_tickets<'a>(
        tickets: impl IntoIterator<Item = &'a TicketMessage>,
    ) -> Result<Self, CryptoError> {
        let mut session = Self::new();
        for ticket in tickets {
            session.add_epoch(ticket)?;
        }

        if session.epochs.is_empty() {
            return Err(CryptoError::EmptySession);
        }
        Ok(session)
    }

    /// Fold the next epoch into the session.
    ///
    /// # Errors
    ///
    /// - `SessionMismatch`: ticket belongs to another session
    /// - `EpochGap`: ticket epoch is not `current_epoch + 1`
    /// - `EpochOverflow`: session already holds `u32::MAX`
    pub fn add_epoch(&mut self, ticket: &TicketMessage) -> Result<(), CryptoError> {
        if let Some(session_id) = self.session_id
            && session_id != ticket.session_id()
        {
            return Err(CryptoError::SessionMismatch {
                expected: session_id.to_hex(),
                actual: ticket.session_id().to_hex(),
            });
        }

        if let Some(current) = self.current_epoch() {
            let expected =
                current.checked_add(1).ok_or(CryptoError::EpochOverflow { current })?;
            if ticket.epoch() != expected {
                return Err(CryptoError::EpochGap { expected, got: ticket.epoch() });
            }
        }

        self.session_id = Some(ticket.session_id());
        self.epochs.insert(ticket.epoch(), ticket.clone());
        Ok(())
    }

    /// Session id, once the first ticket is folded.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Highest folded epoch.
    pub fn current_epoch(&self) -> Option<u32> {
        self.epochs.last_key_value().map(|(epoch, _)| *epoch)
    }

    /// Lowest folded epoch (start of the window).
    pub fn first_epoch(&self) -> Option<u32> {
        self.epochs.first_key_value().map(|(epoch, _)| *epoch)
    }

    /// Number of folded epochs.
    pub fn epoch_count(&self) -> usize {
        self.epochs.len()
    }

    /// Whether `epoch` is inside the folded window.
    pub fn has_epoch(&self, epoch: u32) -> bool {
        self.epochs.contains_key(&epoch)
    }

    /// Mint the ticket for the next epoch. Does not fold it.
    ///
    /// `epoch_key` must be fresh random bytes from the caller.
    ///
    /// # Errors
    ///
    /// - `EmptySession`: nothing folded yet
    /// - `EpochOverflow`: current epoch is `u32::MAX`
    pub fn create_ticket(
        &self,
        epoch_key: [u8; EPOCH_KEY_SIZE],
    ) -> Result<TicketMessage, CryptoError> {
        let (session_id, current) = self.head()?;
        let next = current.checked_add(1).ok_or(CryptoError::EpochOverflow { current })?;
        Ok(TicketMessage::new(session_id, next, epoch_key))
    }

    /// Sign with `signer` and encrypt under the highest epoch.
    ///
    /// # Errors
    ///
    /// - `EmptySession`: nothing folded yet
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        signer: &SigningKey,
        random_suffix: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<GroupMessage, CryptoError> {
        let (session_id, current) = self.head()?;
        let ticket = self.epochs.get(&current).ok_or(CryptoError::EmptySession)?;
        let message_key = derive_message_key(ticket.epoch_key(), &session_id, current);

        Ok(seal(plaintext, &message_key, session_id, signer, random_suffix))
    }

    /// Decrypt a message sealed under any folded epoch.
    ///
    /// # Errors
    ///
    /// - `SessionMismatch`: message belongs to another session
    /// - `EpochNotFound`: message epoch is outside the folded window
    /// - `DecryptionFailed`: authentication failed
    /// - `InvalidSignature`: message was not signed by `verifier`
    pub fn decrypt(
        &self,
        message: &GroupMessage,
        verifier: &VerifyingKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let (session_id, _) = self.head()?;
        if message.session_id != session_id {
            return Err(CryptoError::SessionMismatch {
                expected: session_id.to_hex(),
                actual: message.session_id.to_hex(),
            });
        }

        let ticket = self
            .epochs
            .get(&message.epoch)
            .ok_or(CryptoError::EpochNotFound { epoch: message.epoch })?;
        let message_key = derive_message_key(ticket.epoch_key(), &session_id, message.epoch);

        open(message, &message_key, verifier)
    }

    fn head(&self) -> Result<(SessionId, u32), CryptoError> {
        match (self.session_id, self.current_epoch()) {
            (Some(session_id), Some(current)) => Ok((session_id, current)),
            _ => Err(CryptoError::EmptySession),
        }
    }
}

impl fmt::Debug for GroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSession")
            .field("session_id", &self.session_id)
            .field("first_epoch", &self.first_epoch())
            .field("current_epoch", &self.current_epoch())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_id() -> SessionId {
        SessionId::from_bytes([8; 32])
    }

    fn chain(len: u32) -> Vec<TicketMessage> {
        (0..len).map(|epoch| TicketMessage::new(session_id(), epoch, [epoch as u8; 32])).collect()
    }

    #[test]
    fn fold_tracks_window() {
        let session = GroupSession::from_tickets(&chain(3)).unwrap();

        assert_eq!(session.session_id(), Some(session_id()));
        assert_eq!(session.first_epoch(), Some(0));
        assert_eq!(session.current_epoch(), Some(2));
        assert_eq!(session.epoch_count(), 3);
    }

    #[test]
    fn fold_accepts_window_starting_after_zero() {
        let tickets = chain(6);
        let session = GroupSession::from_tickets(&tickets[3..]).unwrap();

        assert_eq!(session.first_epoch(), Some(3));
        assert!(!session.has_epoch(2));
    }

    #[test]
    fn fold_rejects_gap() {
        let mut tickets = chain(4);
        tickets.remove(2);

        let result = GroupSession::from_tickets(&tickets);
        assert_eq!(result.unwrap_err(), CryptoError::EpochGap { expected: 2, got: 3 });
    }

    #[test]
    fn fold_rejects_out_of_order() {
        let mut tickets = chain(3);
        tickets.swap(0, 1);

        assert!(matches!(
            GroupSession::from_tickets(&tickets),
            Err(CryptoError::EpochGap { expected: 2, got: 0 })
        ));
    }

    #[test]
    fn fold_rejects_foreign_session() {
        let mut session = GroupSession::from_tickets(&chain(1)).unwrap();
        let foreign = TicketMessage::new(SessionId::from_bytes([9; 32]), 1, [0; 32]);

        assert!(matches!(session.add_epoch(&foreign), Err(CryptoError::SessionMismatch { .. })));
        assert_eq!(session.current_epoch(), Some(0));
    }

    #[test]
    fn empty_fold_is_error() {
        let result = GroupSession::from_tickets(std::iter::empty());
        assert_eq!(result.unwrap_err(), CryptoError::EmptySession);
    }

    #[test]
    fn create_ticket_uses_next_epoch() {
        let session = GroupSession::from_tickets(&chain(2)).unwrap();
        let ticket = session.create_ticket([0x77; 32]).unwrap();

        assert_eq!(ticket.epoch(), 2);
        assert_eq!(ticket.session_id(), session_id());
        assert_eq!(session.current_epoch(), Some(1), "minting does not fold");
    }

    #[test]
    fn create_ticket_on_empty_session_fails() {
        assert_eq!(GroupSession::new().create_ticket([0; 32]), Err(CryptoError::EmptySession));
    }

    #[test]
    fn create_ticket_overflow() {
        let head = TicketMessage::new(session_id(), u32::MAX, [0; 32]);
        let session = GroupSession::from_tickets([&head]).unwrap();

        assert_eq!(
            session.create_ticket([0; 32]),
            Err(CryptoError::EpochOverflow { current: u32::MAX })
        );
    }

    #[test]
    fn encrypt_uses_highest_epoch_and_older_epochs_still_decrypt() {
        let alice = SigningKey::from_bytes(&[1; 32]);
        let tickets = chain(3);

        let old = GroupSession::from_tickets(&tickets[..1]).unwrap();
        let old_message = old.encrypt(b"epoch zero", &alice, [0; NONCE_RANDOM_SIZE]).unwrap();
        assert_eq!(old_message.epoch, 0);

        let full = GroupSession::from_tickets(&tickets).unwrap();
        let new_message = full.encrypt(b"epoch two", &alice, [1; NONCE_RANDOM_SIZE]).unwrap();
        assert_eq!(new_message.epoch, 2);

        let verifier = alice.verifying_key();
        assert_eq!(full.decrypt(&old_message, &verifier).unwrap(), b"epoch zero");
        assert_eq!(full.decrypt(&new_message, &verifier).unwrap(), b"epoch two");
        assert_eq!(
            old.decrypt(&new_message, &verifier),
            Err(CryptoError::EpochNotFound { epoch: 2 })
        );
    }

    #[test]
    fn decrypt_rejects_other_session() {
        let alice = SigningKey::from_bytes(&[1; 32]);
        let ours = GroupSession::from_tickets(&chain(1)).unwrap();
        let other_ticket = TicketMessage::new_session(SessionId::from_bytes([9; 32]), [0; 32]);
        let other = GroupSession::from_tickets([&other_ticket]).unwrap();

        let message = other.encrypt(b"elsewhere", &alice, [0; NONCE_RANDOM_SIZE]).unwrap();
        assert!(matches!(
            ours.decrypt(&message, &alice.verifying_key()),
            Err(CryptoError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn same_key_material_in_other_epoch_does_not_decrypt() {
        let alice = SigningKey::from_bytes(&[1; 32]);
        let a = TicketMessage::new(session_id(), 0, [0x55; 32]);
        let session = GroupSession::from_tickets([&a]).unwrap();
        let mut message = session.encrypt(b"hi", &alice, [0; NONCE_RANDOM_SIZE]).unwrap();

        let b = TicketMessage::new(session_id(), 1, [0x55; 32]);
        let mut next = session.clone();
        next.add_epoch(&b).unwrap();
        message.epoch = 1;

        assert!(matches!(
            next.decrypt(&message, &alice.verifying_key()),
            Err(CryptoError::DecryptionFailed { .. })
        ));
    }
}
