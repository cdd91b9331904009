//! Session cipher: encrypt/decrypt over an established (or bootstrapping)
//! session.
//!
//! Grounded on
//! `examples/other_examples/10a67e8f_trocher-libsignal-client__rust-protocol-src-session_cipher.rs.rs`'s
//! `message_encrypt` / `message_decrypt_prekey` / `message_decrypt_signal` /
//! `decrypt_message_with_record` shape: try the open session first, then
//! archived sessions newest-first, promoting on a late success.

use std::sync::Arc;

use tracing::debug;

use crate::address::ProtocolAddress;
use crate::builder::SessionBuilder;
use crate::config::Config;
use crate::error::{Result, SignalError};
use crate::keys::StoredKeyPair;
use crate::primitives::{aes_cbc_decrypt, aes_cbc_encrypt, dh, prefix_public_key, strip_key_prefix, KeyPair};
use crate::ratchet::{kdf_root, perform_dh_ratchet, MessageKeys};
use crate::session::{ReceivingChain, SendingChain, Session, SessionRecord};
use crate::store::SignalStore;
use crate::wire::{PreKeyWhisperMessage, WhisperMessage};

/// Result of `SessionCipher::encrypt`.
#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    /// `1` for a plain `WhisperMessage`, `3` for a `PreKeyWhisperMessage`.
    pub message_type: u8,
    pub body: Vec<u8>,
    pub registration_id: u32,
}

pub struct SessionCipher {
    store: Arc<dyn SignalStore>,
    remote_address: ProtocolAddress,
}

impl SessionCipher {
    pub fn new(store: Arc<dyn SignalStore>, remote_address: ProtocolAddress) -> Self {
        Self { store, remote_address }
    }

    /// Encrypt `plaintext` against the open session for this address.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let address_key = self.remote_address.as_key();
        let mut record = self
            .store
            .load_session(&address_key)
            .await?
            .ok_or_else(|| SignalError::NoSession(address_key.clone()))?;
        let session = record
            .open_session_mut()
            .ok_or_else(|| SignalError::NoSession(address_key.clone()))?;

        if session.sending_chain.is_none() {
            bootstrap_sending_chain(session)?;
        }

        let our_identity = self.store.our_identity().await?;
        let remote_identity_prefixed = prefix_public_key(&session.index_info.remote_identity_key);
        let our_identity_prefixed = prefix_public_key(&our_identity.public);

        let sending_counter = session.sending_chain.as_ref().expect("just bootstrapped").chain_key.counter;
        let (message_keys, next_chain_key) = session
            .sending_chain
            .as_ref()
            .expect("just bootstrapped")
            .chain_key
            .next_message_keys();
        let previous_counter = session.previous_counter;

        let ciphertext = aes_cbc_encrypt(&message_keys.cipher_key, &message_keys.iv, plaintext);
        let ratchet_key = prefix_public_key(&session.ratchet_key_pair().public);

        let whisper = WhisperMessage::build(
            ratchet_key,
            sending_counter,
            previous_counter,
            ciphertext,
            &message_keys.mac_key,
            &our_identity_prefixed,
            &remote_identity_prefixed,
        );

        session.sending_chain = Some(SendingChain { chain_key: next_chain_key });
        let registration_id = session.registration_id;
        let pending = session.pending_prekey.clone();

        let (message_type, body) = match pending {
            Some(pending) => {
                let prekey_message = PreKeyWhisperMessage {
                    version: crate::wire::VERSION_BYTE,
                    registration_id: self.store.our_registration_id().await?,
                    pre_key_id: pending.pre_key_id,
                    signed_prekey_id: pending.signed_key_id,
                    base_key: pending.base_key,
                    identity_key: our_identity_prefixed,
                    message: whisper.serialize(),
                };
                (3u8, prekey_message.serialize())
            }
            None => (1u8, whisper.serialize()),
        };

        self.store.store_session(&address_key, record).await?;
        debug!(target: "crypto::cipher", address = %address_key, message_type, "encrypted outgoing message");

        Ok(EncryptedMessage {
            message_type,
            body,
            registration_id,
        })
    }

    /// Decrypt a plain `WhisperMessage`.
    pub async fn decrypt_whisper_message(&self, body: &[u8]) -> Result<Vec<u8>> {
        let address_key = self.remote_address.as_key();
        let mut record = self
            .store
            .load_session(&address_key)
            .await?
            .ok_or_else(|| SignalError::NoSession(address_key.clone()))?;
        let message = WhisperMessage::parse(body)?;

        let plaintext = self.decrypt_against_record(&mut record, &message).await?;
        self.store.store_session(&address_key, record).await?;
        debug!(target: "crypto::cipher", address = %address_key, "decrypted whisper message");
        Ok(plaintext)
    }

    /// Decrypt a `PreKeyWhisperMessage`, bootstrapping the session first if
    /// necessary.
    pub async fn decrypt_prekey_whisper_message(&self, body: &[u8]) -> Result<Vec<u8>> {
        let address_key = self.remote_address.as_key();
        let outer = PreKeyWhisperMessage::parse(body)?;
        let mut record = self.store.load_session(&address_key).await?.unwrap_or_default();

        let builder = SessionBuilder::new(self.store.clone(), self.remote_address.clone());
        let consumed_prekey_id = builder.init_incoming(&mut record, &outer).await?;

        let inner = WhisperMessage::parse(&outer.message)?;
        let plaintext = self.decrypt_against_record(&mut record, &inner).await?;

        if let Some(pre_key_id) = consumed_prekey_id {
            self.store.remove_prekey(pre_key_id).await?;
        }
        self.store.store_session(&address_key, record).await?;
        debug!(target: "crypto::cipher", address = %address_key, "decrypted prekey whisper message");
        Ok(plaintext)
    }

    /// Try the open session, then archived sessions newest-first, promoting
    /// on a late success.
    async fn decrypt_against_record(&self, record: &mut SessionRecord, message: &WhisperMessage) -> Result<Vec<u8>> {
        let our_identity = self.store.our_identity().await?;
        let mut last_err = None;

        if let Some(session) = record.open_session().cloned() {
            let base_key = session.index_info.base_key;
            match decrypt_with_session(session, message, &our_identity) {
                Ok((plaintext, updated)) => {
                    record.update_session(&base_key, updated);
                    return Ok(plaintext);
                }
                Err(e) => last_err = Some(e),
            }
        }

        let archived: Vec<Session> = record.archived_sessions().cloned().collect();
        for session in archived.into_iter().rev() {
            let base_key = session.index_info.base_key;
            match decrypt_with_session(session, message, &our_identity) {
                Ok((plaintext, updated)) => {
                    record.update_session(&base_key, updated);
                    record.promote_session(&base_key);
                    return Ok(plaintext);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| SignalError::Decrypt("no candidate session decrypted the message".into())))
    }
}

/// Bring up a sending chain from the session's current ratchet identity
/// when none has been derived yet (Bob's state immediately after
/// `initIncoming`, before his first outbound message).
fn bootstrap_sending_chain(session: &mut Session) -> Result<()> {
    let remote_ephemeral = session
        .last_remote_ephemeral
        .ok_or_else(|| SignalError::Structural("no remote ephemeral to bootstrap a sending chain from".into()))?;
    let new_ephemeral = KeyPair::generate();
    let dh_send = dh(new_ephemeral.private_bytes(), &remote_ephemeral);
    let (new_root, sending_chain_key) = kdf_root(&session.root_key, &dh_send);

    session.root_key = new_root;
    session.previous_counter = 0;
    session.ratchet_key_pair = StoredKeyPair::from(&new_ephemeral);
    session.sending_chain = Some(SendingChain { chain_key: sending_chain_key });
    Ok(())
}

/// Attempt to decrypt `message` against `session`. Operates on an owned
/// clone so a MAC failure (or any other error) never leaves a durable
/// trace; only the caller, on `Ok`, writes the returned session back into
/// the record.
fn decrypt_with_session(mut session: Session, message: &WhisperMessage, our_identity: &StoredKeyPair) -> Result<(Vec<u8>, Session)> {
    let sender_identity_prefixed = prefix_public_key(&session.index_info.remote_identity_key);
    let receiver_identity_prefixed = prefix_public_key(&our_identity.public);
    let ratchet_key_raw = strip_key_prefix(&message.ratchet_key)?;

    let is_new_ratchet = session.last_remote_ephemeral != Some(ratchet_key_raw);
    if session.receiving_chain(&ratchet_key_raw).is_none() && is_new_ratchet {
        if let Some(prior_remote) = session.last_remote_ephemeral {
            fill_skipped_keys(&mut session, &prior_remote, message.previous_counter)?;
        }

        let our_current_private = *session.ratchet_key_pair().private_bytes();
        let step = perform_dh_ratchet(&session.root_key, &our_current_private, &ratchet_key_raw);
        let prior_sending_counter = session.sending_chain.as_ref().map(|c| c.chain_key.counter).unwrap_or(0);

        session.root_key = step.new_root_key;
        session.set_receiving_chain(ReceivingChain {
            ratchet_key: ratchet_key_raw,
            chain_key: step.receiving_chain_key,
        });
        session.previous_counter = prior_sending_counter;
        session.ratchet_key_pair = StoredKeyPair::from(&step.new_sending_ephemeral);
        session.sending_chain = Some(SendingChain { chain_key: step.sending_chain_key });
        session.last_remote_ephemeral = Some(ratchet_key_raw);
    }

    let message_keys = get_or_create_message_keys(&mut session, &ratchet_key_raw, message.counter)?;

    if !message.verify_mac(&message_keys.mac_key, &sender_identity_prefixed, &receiver_identity_prefixed) {
        return Err(SignalError::Mac);
    }

    let plaintext = aes_cbc_decrypt(&message_keys.cipher_key, &message_keys.iv, &message.ciphertext)?;
    // A successful decrypt proves the peer already holds this session, so
    // there is no longer any need to attach our prekey bundle identifiers.
    session.pending_prekey = None;
    Ok((plaintext, session))
}

/// Resolve the message key for `counter` on the receiving chain keyed by
/// `ratchet_key`: either a cached skipped key, or the result of stepping
/// the chain forward, caching every intermediate key along the way.
fn get_or_create_message_keys(session: &mut Session, ratchet_key: &[u8; 32], counter: u32) -> Result<MessageKeys> {
    let current_chain_key = session
        .receiving_chain(ratchet_key)
        .ok_or_else(|| SignalError::Structural("missing receiving chain after ratchet bootstrap".into()))?
        .chain_key
        .clone();

    if counter < current_chain_key.counter {
        return session
            .take_skipped_key(ratchet_key, counter)
            .ok_or_else(|| SignalError::MessageCounter(format!("message key for counter {counter} already consumed or never skipped")));
    }

    let gap = counter - current_chain_key.counter;
    if gap > Config::global().max_forward_jump {
        return Err(SignalError::MessageCounter(format!("chain advance of {gap} exceeds the configured cap")));
    }

    let mut current = current_chain_key;
    let mut result = None;
    loop {
        let at_target = current.counter == counter;
        let (mk, next) = current.next_message_keys();
        if at_target {
            result = Some(mk);
            current = next;
            break;
        }
        session.cache_skipped_key(*ratchet_key, current.counter, mk);
        current = next;
    }

    if let Some(chain) = session.receiving_chain_mut(ratchet_key) {
        chain.chain_key = current;
    }

    result.ok_or_else(|| SignalError::Structural("message key derivation did not reach the target counter".into()))
}

/// Drain remaining message keys on the chain being superseded by a new DH
/// ratchet step, caching them as skipped keys up to `up_to_counter`.
fn fill_skipped_keys(session: &mut Session, ratchet_key: &[u8; 32], up_to_counter: u32) -> Result<()> {
    let current_chain_key = match session.receiving_chain(ratchet_key) {
        Some(chain) => chain.chain_key.clone(),
        None => return Ok(()),
    };
    if up_to_counter < current_chain_key.counter {
        return Ok(());
    }

    let gap = up_to_counter - current_chain_key.counter;
    if gap > Config::global().max_forward_jump {
        return Err(SignalError::MessageCounter(format!(
            "chain advance of {gap} exceeds the configured cap while closing out the prior chain"
        )));
    }

    let mut current = current_chain_key;
    while current.counter < up_to_counter {
        let (mk, next) = current.next_message_keys();
        session.cache_skipped_key(*ratchet_key, current.counter, mk);
        current = next;
    }

    if let Some(chain) = session.receiving_chain_mut(ratchet_key) {
        chain.chain_key = current;
    }
    Ok(())
}
