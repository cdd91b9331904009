//! Asynchronous session bootstrap: the X3DH handshake that turns a
//! published PreKey bundle into an initial root key and ratchet state.
//!
//! Grounded on the teacher's `X3DHProtocol::perform_as_initiator`/
//! `perform_as_responder` for the overall "verify, compute DH products,
//! derive keys, install session" control flow, generalized to use a
//! normative `0xFF*32`-prefixed concatenation order (the teacher's own
//! formula omits that domain separator and keeps a 32-byte-only root key).
//! The teacher's `InitiatorState` notes that the X3DH base key is reused
//! directly as the first ratchet keypair rather than regenerated; that
//! invariant carries over unchanged here.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::address::ProtocolAddress;
use crate::error::{Result, SignalError};
use crate::keys::{verify_signature, StoredKeyPair};
use crate::primitives::{self, dh, strip_key_prefix, KeyPair};
use crate::ratchet::{kdf_root, x3dh_derive};
use crate::session::{BaseKeyType, IndexInfo, PendingPreKey, ReceivingChain, Session, SessionRecord, SendingChain};
use crate::store::SignalStore;
use crate::wire::PreKeyWhisperMessage;

/// A published PreKey bundle: the public material a peer needs to
/// bootstrap an outgoing session without us being online.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub signed_prekey_public: [u8; 32],
    pub signed_prekey_signature: [u8; 64],
    pub prekey: Option<(u32, [u8; 32])>,
}

pub struct SessionBuilder {
    store: Arc<dyn SignalStore>,
    remote_address: ProtocolAddress,
}

impl SessionBuilder {
    pub fn new(store: Arc<dyn SignalStore>, remote_address: ProtocolAddress) -> Self {
        Self { store, remote_address }
    }

    /// Bootstrap an outgoing session from a remote bundle.
    pub async fn init_outgoing(&self, bundle: &PreKeyBundle) -> Result<()> {
        let prefixed_spk = primitives::prefix_public_key(&bundle.signed_prekey_public);
        if !verify_signature(&bundle.identity_key, &prefixed_spk, &bundle.signed_prekey_signature) {
            return Err(SignalError::InvalidSignature);
        }

        let address_key = self.remote_address.as_key();
        let prefixed_identity = primitives::prefix_public_key(&bundle.identity_key);
        if !self.store.is_trusted_identity(&address_key, &prefixed_identity).await? {
            return Err(SignalError::UntrustedIdentityKey(address_key));
        }

        let our_identity = KeyPair::from(&self.store.our_identity().await?);
        let base_key = KeyPair::generate();

        let dh1 = dh(our_identity.private_bytes(), &bundle.signed_prekey_public);
        let dh2 = dh(base_key.private_bytes(), &bundle.identity_key);
        let dh3 = dh(base_key.private_bytes(), &bundle.signed_prekey_public);
        let dh4 = bundle.prekey.map(|(_, public)| dh(base_key.private_bytes(), &public));

        let secrets = x3dh_derive(&dh1, &dh2, &dh3, dh4.as_ref());
        // The sender's first DH ratchet step: fold DH3 in a second time
        // through the ratchet engine's root KDF to get a working sending
        // chain. The base key doubles as the first ratchet keypair, it is
        // never regenerated.
        let (final_root, sending_chain_key) = kdf_root(&secrets.root_key, &dh3);

        let prefixed_base_key = primitives::prefix_public_key(&base_key.public);
        let session = Session {
            registration_id: bundle.registration_id,
            root_key: final_root,
            ratchet_key_pair: StoredKeyPair::from(&base_key),
            last_remote_ephemeral: Some(bundle.signed_prekey_public),
            previous_counter: 0,
            sending_chain: Some(SendingChain {
                chain_key: sending_chain_key,
            }),
            receiving_chains: Vec::new(),
            index_info: IndexInfo {
                remote_identity_key: bundle.identity_key,
                base_key: prefixed_base_key,
                base_key_type: BaseKeyType::Ours,
                closed: -1,
            },
            pending_prekey: Some(PendingPreKey {
                pre_key_id: bundle.prekey.map(|(id, _)| id),
                signed_key_id: bundle.signed_prekey_id,
                base_key: prefixed_base_key,
            }),
            skipped_message_keys: VecDeque::new(),
        };

        let mut record = self.store.load_session(&address_key).await?.unwrap_or_default();
        record.set_session(session);
        self.store.save_identity(&address_key, &prefixed_identity).await?;
        self.store.store_session(&address_key, record).await?;
        debug!(target: "crypto::builder", address = %address_key, "installed outgoing session");
        Ok(())
    }

    /// Bootstrap a session from an inbound `PreKeyWhisperMessage`. Returns
    /// the consumed one-time prekey id, if any, so the caller can delete it
    /// only after the embedded message decrypts successfully.
    pub async fn init_incoming(&self, record: &mut SessionRecord, message: &PreKeyWhisperMessage) -> Result<Option<u32>> {
        if record.session_by_base_key(&message.base_key).is_some() {
            // Idempotent retransmission of a bundle we've already processed.
            return Ok(None);
        }

        let address_key = self.remote_address.as_key();
        if !self.store.is_trusted_identity(&address_key, &message.identity_key).await? {
            return Err(SignalError::UntrustedIdentityKey(address_key));
        }

        let signed_prekey = self
            .store
            .load_signed_prekey(message.signed_prekey_id)
            .await?
            .ok_or(SignalError::InvalidKeyId(message.signed_prekey_id))?;
        let one_time_prekey = match message.pre_key_id {
            Some(id) => Some(
                self.store
                    .load_prekey(id)
                    .await?
                    .ok_or(SignalError::InvalidKeyId(id))?,
            ),
            None => None,
        };

        let our_identity = KeyPair::from(&self.store.our_identity().await?);
        let signed_prekey_kp = KeyPair::from(&signed_prekey);
        let base_key_raw = strip_key_prefix(&message.base_key)?;
        let remote_identity_raw = strip_key_prefix(&message.identity_key)?;

        let dh1 = dh(signed_prekey_kp.private_bytes(), &remote_identity_raw);
        let dh2 = dh(our_identity.private_bytes(), &base_key_raw);
        let dh3 = dh(signed_prekey_kp.private_bytes(), &base_key_raw);
        let dh4 = one_time_prekey
            .as_ref()
            .map(|opk| dh(KeyPair::from(opk).private_bytes(), &base_key_raw));

        let secrets = x3dh_derive(&dh1, &dh2, &dh3, dh4.as_ref());
        let (final_root, receiving_chain_key) = kdf_root(&secrets.root_key, &dh3);

        let session = Session {
            registration_id: message.registration_id,
            root_key: final_root,
            // Bob has no sending chain yet; his current ratchet keypair is
            // the signed prekey he already published and used in the DH
            // products above, until `encrypt` forces a fresh one.
            ratchet_key_pair: StoredKeyPair::from(&signed_prekey_kp),
            last_remote_ephemeral: Some(base_key_raw),
            previous_counter: 0,
            sending_chain: None,
            receiving_chains: vec![ReceivingChain {
                ratchet_key: base_key_raw,
                chain_key: receiving_chain_key,
            }],
            index_info: IndexInfo {
                remote_identity_key: remote_identity_raw,
                base_key: message.base_key,
                base_key_type: BaseKeyType::Theirs,
                closed: -1,
            },
            pending_prekey: None,
            skipped_message_keys: VecDeque::new(),
        };

        record.set_session(session);
        self.store.save_identity(&address_key, &message.identity_key).await?;
        debug!(target: "crypto::builder", address = %address_key, "installed incoming session");
        Ok(message.pre_key_id)
    }
}
