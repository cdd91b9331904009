//! Centralized configuration for the ratchet core.
//!
//! Tunables that would otherwise be scattered magic numbers live here.

use std::sync::OnceLock;

/// Global configuration singleton.
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    // ============================================
    // DOUBLE RATCHET PARAMETERS
    // ============================================
    /// Maximum skipped message keys retained per session (DoS protection).
    /// Normative value per the Signal wire protocol: 2000.
    pub max_skipped_message_keys: u32,

    /// Maximum archived (closed) sessions retained per record; oldest evicted first.
    pub max_archived_sessions: usize,

    /// Maximum forward jump (in message-key derivations) tolerated in one
    /// chain-advance when filling skipped keys. Same cap as
    /// `max_skipped_message_keys` (a single session cannot skip further
    /// than its own retention limit would let it recover from).
    pub max_forward_jump: u32,

    // ============================================
    // KEY SIZES (informational; primitives hardcode these, exposed for callers)
    // ============================================
    pub public_key_size: usize,
    pub signature_size: usize,
}

impl Config {
    pub fn default() -> Self {
        Self {
            max_skipped_message_keys: 2000,
            max_archived_sessions: 40,
            max_forward_jump: 2000,
            public_key_size: 32,
            signature_size: 64,
        }
    }

    /// Build configuration from environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MAX_SKIPPED_MESSAGE_KEYS") {
            if let Ok(parsed) = val.parse() {
                config.max_skipped_message_keys = parsed;
                config.max_forward_jump = parsed;
            }
        }

        if let Ok(val) = std::env::var("MAX_ARCHIVED_SESSIONS") {
            if let Ok(parsed) = val.parse() {
                config.max_archived_sessions = parsed;
            }
        }

        config
    }

    /// Fetch the global instance, initializing with defaults on first access.
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(Self::default)
    }

    /// Initialize the global config with defaults.
    pub fn init() -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(Self::default())
            .map_err(|_| "Config already initialized")
    }

    /// Initialize the global config from environment variables.
    pub fn init_from_env() -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(Self::from_env())
            .map_err(|_| "Config already initialized")
    }

    /// Initialize the global config with a caller-supplied instance.
    /// Tests use this to shrink `max_skipped_message_keys` so the
    /// overflow/eviction behavior can be exercised without generating
    /// thousands of real messages.
    pub fn init_with(config: Config) -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(config)
            .map_err(|_| "Config already initialized")
    }

    pub fn is_initialized() -> bool {
        GLOBAL_CONFIG.get().is_some()
    }
}
