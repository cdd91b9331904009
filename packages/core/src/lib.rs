//! Signal-protocol-style session core: X3DH bootstrap plus a Double
//! Ratchet engine, independent of any particular transport or storage
//! backend.

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod address;
pub mod builder;
pub mod cipher;
pub mod config;
pub mod error;
pub mod keys;
pub mod primitives;
pub mod queue;
pub mod ratchet;
pub mod session;
pub mod store;
pub mod utils;
pub mod wire;

pub use address::ProtocolAddress;
pub use builder::{PreKeyBundle, SessionBuilder};
pub use cipher::{EncryptedMessage, SessionCipher};
pub use error::{Result, SignalError};
pub use keys::{generate_prekey, generate_signed_prekey, verify_signature, IdentityKeyPair, PreKey, SignedPreKey, StoredKeyPair};
pub use queue::JobQueue;
pub use session::{Session, SessionRecord};
pub use store::{InMemoryStore, SignalStore};
pub use wire::{PreKeyWhisperMessage, WhisperMessage};

