//! The store boundary and an in-memory reference implementation.
//!
//! Grounded on the teacher's `storage/memory.rs` `MemoryStorage`
//! (HashMap-backed save/load/delete), converted from synchronous calls to
//! an `async_trait` object so every store operation can cross an I/O
//! boundary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::keys::StoredKeyPair;
use crate::session::SessionRecord;

#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn load_session(&self, address: &str) -> Result<Option<SessionRecord>>;
    async fn store_session(&self, address: &str, record: SessionRecord) -> Result<()>;
    async fn is_trusted_identity(&self, address: &str, identity_key: &[u8; 33]) -> Result<bool>;
    async fn save_identity(&self, address: &str, identity_key: &[u8; 33]) -> Result<()>;
    async fn load_prekey(&self, key_id: u32) -> Result<Option<StoredKeyPair>>;
    async fn remove_prekey(&self, key_id: u32) -> Result<()>;
    async fn load_signed_prekey(&self, key_id: u32) -> Result<Option<StoredKeyPair>>;
    async fn our_registration_id(&self) -> Result<u32>;
    async fn our_identity(&self) -> Result<StoredKeyPair>;
}

/// An in-memory `SignalStore`, suitable for tests and examples. Trusts a
/// remote identity on first contact (TOFU) and flags any later mismatch.
pub struct InMemoryStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    trusted_identities: Mutex<HashMap<String, [u8; 33]>>,
    prekeys: Mutex<HashMap<u32, StoredKeyPair>>,
    signed_prekeys: Mutex<HashMap<u32, StoredKeyPair>>,
    registration_id: u32,
    identity: StoredKeyPair,
}

impl InMemoryStore {
    pub fn new(identity: StoredKeyPair, registration_id: u32) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            trusted_identities: Mutex::new(HashMap::new()),
            prekeys: Mutex::new(HashMap::new()),
            signed_prekeys: Mutex::new(HashMap::new()),
            registration_id,
            identity,
        })
    }

    pub async fn insert_prekey(&self, key_id: u32, key_pair: StoredKeyPair) {
        self.prekeys.lock().await.insert(key_id, key_pair);
    }

    pub async fn insert_signed_prekey(&self, key_id: u32, key_pair: StoredKeyPair) {
        self.signed_prekeys.lock().await.insert(key_id, key_pair);
    }
}

#[async_trait]
impl SignalStore for InMemoryStore {
    async fn load_session(&self, address: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.lock().await.get(address).cloned())
    }

    async fn store_session(&self, address: &str, record: SessionRecord) -> Result<()> {
        self.sessions.lock().await.insert(address.to_string(), record);
        Ok(())
    }

    async fn is_trusted_identity(&self, address: &str, identity_key: &[u8; 33]) -> Result<bool> {
        let known = self.trusted_identities.lock().await;
        match known.get(address) {
            Some(existing) => Ok(existing == identity_key),
            None => {
                debug!(target: "crypto::store", %address, "trusting identity key on first contact");
                Ok(true)
            }
        }
    }

    async fn save_identity(&self, address: &str, identity_key: &[u8; 33]) -> Result<()> {
        self.trusted_identities
            .lock()
            .await
            .insert(address.to_string(), *identity_key);
        Ok(())
    }

    async fn load_prekey(&self, key_id: u32) -> Result<Option<StoredKeyPair>> {
        Ok(self.prekeys.lock().await.get(&key_id).cloned())
    }

    async fn remove_prekey(&self, key_id: u32) -> Result<()> {
        self.prekeys.lock().await.remove(&key_id);
        Ok(())
    }

    async fn load_signed_prekey(&self, key_id: u32) -> Result<Option<StoredKeyPair>> {
        Ok(self.signed_prekeys.lock().await.get(&key_id).cloned())
    }

    async fn our_registration_id(&self) -> Result<u32> {
        Ok(self.registration_id)
    }

    async fn our_identity(&self) -> Result<StoredKeyPair> {
        Ok(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::IdentityKeyPair;

    #[tokio::test]
    async fn trusts_new_identity_on_first_contact_then_pins_it() {
        let identity = IdentityKeyPair::generate();
        let store = InMemoryStore::new(StoredKeyPair::from(&identity.key_pair), 42);

        let a = [0x05u8; 33];
        let b = [0x06u8; 33];
        assert!(store.is_trusted_identity("bob.1", &a).await.unwrap());
        store.save_identity("bob.1", &a).await.unwrap();
        assert!(store.is_trusted_identity("bob.1", &a).await.unwrap());
        assert!(!store.is_trusted_identity("bob.1", &b).await.unwrap());
    }

    #[tokio::test]
    async fn prekey_removal_is_idempotent() {
        let identity = IdentityKeyPair::generate();
        let store = InMemoryStore::new(StoredKeyPair::from(&identity.key_pair), 42);
        let prekey = crate::keys::generate_prekey(7);
        store.insert_prekey(7, StoredKeyPair::from(&prekey.key_pair)).await;
        assert!(store.load_prekey(7).await.unwrap().is_some());
        store.remove_prekey(7).await.unwrap();
        assert!(store.load_prekey(7).await.unwrap().is_none());
        store.remove_prekey(7).await.unwrap();
    }
}
