//! Identity/prekey/signed-prekey generation.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::primitives::{self, xeddsa, KeyPair};

/// An identity keypair; additionally capable of XEdDSA signatures.
pub struct IdentityKeyPair {
    pub key_pair: KeyPair,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            key_pair: KeyPair::generate(),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key_pair.public
    }

    /// Sign `message` with this identity's private key (XEdDSA).
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        xeddsa::sign(self.key_pair.private_bytes(), &self.key_pair.public, message)
    }
}

/// Verify an XEdDSA signature made by the holder of `public_key`.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    xeddsa::verify(public_key, message, signature)
}

/// A keypair in its store-persisted form. The private half is zeroized on
/// drop, matching [`crate::primitives::KeyPair`].
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredKeyPair {
    #[zeroize(skip)]
    pub public: [u8; 32],
    pub private: [u8; 32],
}

impl From<&KeyPair> for StoredKeyPair {
    fn from(kp: &KeyPair) -> Self {
        Self {
            public: kp.public,
            private: *kp.private_bytes(),
        }
    }
}

impl From<&StoredKeyPair> for KeyPair {
    fn from(stored: &StoredKeyPair) -> Self {
        KeyPair::from_private(stored.private)
    }
}

/// A one-time Curve25519 keypair, identified by a small integer id.
pub struct PreKey {
    pub key_id: u32,
    pub key_pair: KeyPair,
}

pub fn generate_prekey(key_id: u32) -> PreKey {
    PreKey {
        key_id,
        key_pair: KeyPair::generate(),
    }
}

/// A medium-term keypair whose public half is signed by the identity key.
pub struct SignedPreKey {
    pub key_id: u32,
    pub key_pair: KeyPair,
    pub signature: [u8; 64],
    pub timestamp: u64,
}

pub fn generate_signed_prekey(identity: &IdentityKeyPair, key_id: u32) -> SignedPreKey {
    let key_pair = KeyPair::generate();
    let prefixed = primitives::prefix_public_key(&key_pair.public);
    let signature = identity.sign(&prefixed);
    SignedPreKey {
        key_id,
        key_pair,
        signature,
        timestamp: crate::utils::time::current_timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_prekey_signature_verifies() {
        let identity = IdentityKeyPair::generate();
        let spk = generate_signed_prekey(&identity, 1);
        let prefixed = primitives::prefix_public_key(&spk.key_pair.public);
        assert!(verify_signature(&identity.public_key(), &prefixed, &spk.signature));
    }

    #[test]
    fn tampered_signed_prekey_signature_fails() {
        let identity = IdentityKeyPair::generate();
        let mut spk = generate_signed_prekey(&identity, 1);
        spk.signature[0] ^= 0xFF;
        let prefixed = primitives::prefix_public_key(&spk.key_pair.public);
        assert!(!verify_signature(&identity.public_key(), &prefixed, &spk.signature));
    }

    #[test]
    fn registration_id_in_bounds() {
        for _ in 0..50 {
            let id = primitives::generate_registration_id();
            assert!(id >= 1 && id <= 16380);
        }
    }
}
