//! Concrete cryptographic primitives: Curve25519 DH, XEdDSA, HKDF, HMAC-SHA256,
//! AES-256-CBC with PKCS#7, and a CSPRNG helper.
//!
//! These are free functions rather than a pluggable provider trait: the
//! wire format is normative and fixed to one primitive set, so there is no
//! crypto-agility to abstract over.

pub mod xeddsa;

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SignalError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// The Signal wire-format type-prefix byte for Curve25519 public keys.
pub const DJB_KEY_TYPE: u8 = 0x05;

/// A Curve25519 (Montgomery form) keypair. The private half is zeroized on drop.
#[derive(Clone)]
pub struct KeyPair {
    pub public: [u8; 32],
    private: PrivateKeyBytes,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct PrivateKeyBytes([u8; 32]);

impl KeyPair {
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            public: public.to_bytes(),
            private: PrivateKeyBytes(secret.to_bytes()),
        }
    }

    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(private);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            public: public.to_bytes(),
            private: PrivateKeyBytes(secret.to_bytes()),
        }
    }

    pub fn private_bytes(&self) -> &[u8; 32] {
        &self.private.0
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use base64::Engine;
        f.debug_struct("KeyPair")
            .field("public", &base64::engine::general_purpose::STANDARD.encode(self.public))
            .finish()
    }
}

/// Prefix a raw 32-byte Curve25519 public key with the `0x05` wire-format tag.
pub fn prefix_public_key(public: &[u8; 32]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = DJB_KEY_TYPE;
    out[1..].copy_from_slice(public);
    out
}

/// Strip the `0x05` wire-format tag from a 33-byte prefixed public key.
pub fn strip_key_prefix(prefixed: &[u8]) -> Result<[u8; 32]> {
    if prefixed.len() != 33 || prefixed[0] != DJB_KEY_TYPE {
        return Err(SignalError::Structural(
            "expected a 33-byte 0x05-prefixed public key".into(),
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&prefixed[1..]);
    Ok(out)
}

/// X25519 scalar multiplication. Inputs are raw (unprefixed) 32-byte keys.
pub fn dh(private: &[u8; 32], public: &[u8; 32]) -> [u8; 32] {
    let secret = x25519_dalek::StaticSecret::from(*private);
    let public = x25519_dalek::PublicKey::from(*public);
    secret.diffie_hellman(&public).to_bytes()
}

/// HMAC-SHA256-based HKDF-Extract-then-Expand, per RFC 5869.
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    // Only fails if len > 255 * hash_len (255 * 32 = 8160), never hit here.
    hk.expand(info, &mut okm).expect("HKDF expand length in range");
    okm
}

/// HKDF with the spec's default all-zero 32-byte salt.
pub fn hkdf_default_salt(ikm: &[u8], info: &[u8], len: usize) -> Vec<u8> {
    hkdf(ikm, &[0u8; 32], info, len)
}

/// HMAC-SHA256(key, data) -> 32 bytes.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// AES-256-CBC encrypt with PKCS#7 padding.
pub fn aes_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new_from_slices(key, iv)
        .expect("32-byte key and 16-byte IV are always valid for AES-256-CBC")
        .encrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(plaintext)
}

/// AES-256-CBC decrypt with PKCS#7 unpadding. Fails on a padding error.
pub fn aes_cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
    Aes256CbcDec::new_from_slices(key, iv)
        .expect("32-byte key and 16-byte IV are always valid for AES-256-CBC")
        .decrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(ciphertext)
        .map_err(|e| SignalError::Decrypt(format!("AES-CBC padding error: {e}")))
}

/// CSPRNG bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand_core::OsRng.fill_bytes(&mut buf);
    buf
}

/// 14-bit registration id uniform in `[1, 16380]`.
pub fn generate_registration_id() -> u32 {
    let mut buf = [0u8; 2];
    rand_core::OsRng.fill_bytes(&mut buf);
    let raw = u16::from_be_bytes(buf) as u32;
    (raw % 16380) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let shared_a = dh(a.private_bytes(), &b.public);
        let shared_b = dh(b.private_bytes(), &a.public);
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn prefix_roundtrip() {
        let kp = KeyPair::generate();
        let prefixed = prefix_public_key(&kp.public);
        assert_eq!(prefixed[0], DJB_KEY_TYPE);
        let stripped = strip_key_prefix(&prefixed).unwrap();
        assert_eq!(stripped, kp.public);
    }

    #[test]
    fn aes_cbc_roundtrip() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let pt = b"the quick brown fox";
        let ct = aes_cbc_encrypt(&key, &iv, pt);
        let back = aes_cbc_decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn hmac_is_deterministic() {
        let a = hmac_sha256(b"key", b"data");
        let b = hmac_sha256(b"key", b"data");
        assert_eq!(a, b);
    }

    #[test]
    fn registration_id_in_range() {
        for _ in 0..100 {
            let id = generate_registration_id();
            assert!(id >= 1 && id <= 16380);
        }
    }
}
