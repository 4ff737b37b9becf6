//! Error taxonomy for the encryption core.

/// Errors surfaced by the encryption core.
///
/// `Clone` so a single failed unwrap can be handed to every caller that was
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum E2eError {
    /// The platform could not generate or persist key material.
    #[error("Key generation failed: {0}")]
    KeyGenerationFailure(String),

    /// A wrapped key was sealed for a different public key.
    #[error("Wrapped key does not match the local private key")]
    KeyMismatch,

    /// No private key exists on this device (new device, cleared storage).
    #[error("No local private key on this device")]
    MissingPrivateKey,

    /// No wrapped channel key is on record for this user and channel.
    #[error("No key grant for user {user_id} in channel {channel_id}")]
    MissingGrant { channel_id: String, user_id: String },

    /// The channel already has grants; provisioning would replace its key.
    #[error("Channel {channel_id} already has key grants")]
    AlreadyProvisioned { channel_id: String },

    /// Wrong key, corrupted ciphertext, or missing/invalid nonce.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Key vault error: {0}")]
    Vault(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl E2eError {
    pub fn missing_grant(channel_id: &str, user_id: &str) -> Self {
        Self::MissingGrant {
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, E2eError>;
