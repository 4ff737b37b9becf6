//! Interfaces to the hosted backend.
//!
//! The backend stores public keys and wrapped grants. It never sees a
//! private key or an unwrapped channel key.

mod memory;

use async_trait::async_trait;

use crate::crypto::{PublicKeyMaterial, WrappedKey};
use crate::error::Result;

pub use memory::MemoryBackend;

/// Published identity public keys, one per user.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn get_public_key(&self, user_id: &str) -> Result<Option<PublicKeyMaterial>>;

    async fn set_public_key(&self, user_id: &str, key: &PublicKeyMaterial) -> Result<()>;
}

/// Wrapped channel keys, one per (channel, member) pair.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn get_grant(&self, channel_id: &str, user_id: &str) -> Result<Option<WrappedKey>>;

    async fn put_grant(&self, channel_id: &str, user_id: &str, wrapped: &WrappedKey) -> Result<()>;

    /// Store a grant only if the member has none. Returns `false` when one
    /// was already on record; the existing grant is left untouched.
    async fn insert_grant(&self, channel_id: &str, user_id: &str, wrapped: &WrappedKey) -> Result<bool>;

    /// Called on membership revocation. Does not rotate the channel key.
    async fn delete_grant(&self, channel_id: &str, user_id: &str) -> Result<()>;

    async fn list_grantees(&self, channel_id: &str) -> Result<Vec<String>>;
}
