//! Error taxonomy for the session core.
//!
//! One enum, one variant per failure kind in the normative table; callers
//! match on variants rather than parsing messages.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("remote identity key is not trusted for {0}")]
    UntrustedIdentityKey(String),

    #[error("signed prekey signature verification failed")]
    InvalidSignature,

    #[error("unknown key id: {0}")]
    InvalidKeyId(u32),

    #[error("no session for {0}")]
    NoSession(String),

    #[error("message counter error: {0}")]
    MessageCounter(String),

    #[error("MAC verification failed")]
    Mac,

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("structural error: {0}")]
    Structural(String),

    #[error("store error: {0}")]
    Store(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

pub type Result<T> = std::result::Result<T, SignalError>;
