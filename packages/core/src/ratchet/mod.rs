//! Root-key / chain-key / message-key derivation.
//!
//! Grounded on the teacher's `perform_dh_ratchet` control flow for the
//! overall DH-ratchet-step shape, and on the HMAC 0x01/0x02 chain-step +
//! HKDF-80-byte message-key split used by real Signal-family
//! implementations (the teacher's own `kdf_ck` uses a single HKDF expand
//! instead, which does not match the wire-compatible formula required here).

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::primitives::{dh, hkdf, hkdf_default_salt, hmac_sha256, KeyPair};

const ROOT_INFO: &[u8] = b"WhisperRatchet";
const MESSAGE_KEYS_INFO: &[u8] = b"WhisperMessageKeys";
pub const X3DH_INFO: &[u8] = b"WhisperText";

/// A symmetric chain key plus how many message keys it has produced.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    pub key: [u8; 32],
    #[zeroize(skip)]
    pub counter: u32,
}

/// Key material derived for exactly one message.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub iv: [u8; 16],
}

impl ChainKey {
    pub fn new(key: [u8; 32], counter: u32) -> Self {
        Self { key, counter }
    }

    /// Chain-key step: derive this step's raw message key and the next chain key.
    fn step(&self) -> ([u8; 32], ChainKey) {
        let message_key_raw = hmac_sha256(&self.key, &[0x01]);
        let next_key = hmac_sha256(&self.key, &[0x02]);
        (
            message_key_raw,
            ChainKey {
                key: next_key,
                counter: self.counter + 1,
            },
        )
    }

    /// Advance the chain by one step, returning the derived message keys
    /// for the *current* counter and the chain key for `counter + 1`.
    pub fn next_message_keys(&self) -> (MessageKeys, ChainKey) {
        let (raw, next) = self.step();
        (derive_message_keys(&raw), next)
    }
}

fn derive_message_keys(raw: &[u8; 32]) -> MessageKeys {
    let okm = hkdf_default_salt(raw, MESSAGE_KEYS_INFO, 80);
    let mut cipher_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    let mut iv = [0u8; 16];
    cipher_key.copy_from_slice(&okm[0..32]);
    mac_key.copy_from_slice(&okm[32..64]);
    iv.copy_from_slice(&okm[64..80]);
    MessageKeys {
        cipher_key,
        mac_key,
        iv,
    }
}

/// Root-key KDF: `hkdf(ikm=dhOutput, salt=rootKey, info="WhisperRatchet", L=64)`.
pub fn kdf_root(root_key: &[u8; 32], dh_output: &[u8; 32]) -> ([u8; 32], ChainKey) {
    let okm = hkdf(dh_output, root_key, ROOT_INFO, 64);
    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&okm[0..32]);
    chain_key.copy_from_slice(&okm[32..64]);
    (new_root, ChainKey::new(chain_key, 0))
}

/// X3DH initial secret derivation, initiator-side concatenation order; the
/// responder mirrors this with DH arguments swapped so the products line up.
pub struct X3dhSecrets {
    pub root_key: [u8; 32],
    pub chain_key: ChainKey,
}

/// Build the `0xFF*32 || DH1 || DH2 || DH3 [|| DH4]` master secret and
/// derive the initial root/chain key from it.
pub fn x3dh_derive(dh1: &[u8; 32], dh2: &[u8; 32], dh3: &[u8; 32], dh4: Option<&[u8; 32]>) -> X3dhSecrets {
    let mut master_secret = Vec::with_capacity(32 + 32 * 4);
    master_secret.extend_from_slice(&[0xFFu8; 32]);
    master_secret.extend_from_slice(dh1);
    master_secret.extend_from_slice(dh2);
    master_secret.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        master_secret.extend_from_slice(dh4);
    }

    let derived = hkdf_default_salt(&master_secret, X3DH_INFO, 64);
    let mut root_key = [0u8; 32];
    let mut chain_key_bytes = [0u8; 32];
    root_key.copy_from_slice(&derived[0..32]);
    chain_key_bytes.copy_from_slice(&derived[32..64]);

    X3dhSecrets {
        root_key,
        chain_key: ChainKey::new(chain_key_bytes, 0),
    }
}

/// The outcome of one DH ratchet step.
pub struct DhRatchetStep {
    pub new_root_key: [u8; 32],
    pub receiving_chain_key: ChainKey,
    pub new_sending_ephemeral: KeyPair,
    pub sending_chain_key: ChainKey,
}

/// Perform a full DH ratchet step: fold in the remote's new ephemeral to
/// produce a receiving chain, generate a fresh ephemeral of our own, and
/// fold that in against the same remote ephemeral to produce a sending chain.
pub fn perform_dh_ratchet(root_key: &[u8; 32], our_current_private: &[u8; 32], remote_ephemeral: &[u8; 32]) -> DhRatchetStep {
    let dh_recv = dh(our_current_private, remote_ephemeral);
    let (root_after_recv, receiving_chain_key) = kdf_root(root_key, &dh_recv);

    let new_sending_ephemeral = KeyPair::generate();
    let dh_send = dh(new_sending_ephemeral.private_bytes(), remote_ephemeral);
    let (root_after_send, sending_chain_key) = kdf_root(&root_after_recv, &dh_send);

    DhRatchetStep {
        new_root_key: root_after_send,
        receiving_chain_key,
        new_sending_ephemeral,
        sending_chain_key,
    }
}
