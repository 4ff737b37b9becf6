//! Identity key store: one long-lived X25519 keypair per user and device.

use std::sync::Arc;

use tracing::{info, warn};

use super::storage::KeyVault;
use super::types::{PrivateKeyHandle, PublicKeyMaterial};
use crate::error::{E2eError, Result};

/// Generates and loads the local user's identity keypair.
///
/// The private half is written to the [`KeyVault`] and never leaves it except
/// as an opaque [`PrivateKeyHandle`].
#[derive(Clone)]
pub struct IdentityKeyStore {
    user_id: String,
    vault: Arc<dyn KeyVault>,
}

impl IdentityKeyStore {
    pub fn new(user_id: impl Into<String>, vault: Arc<dyn KeyVault>) -> Self {
        Self {
            user_id: user_id.into(),
            vault,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Create a fresh keypair, persist the private half, return the public half.
    ///
    /// Overwrites any key already in the vault. Callers only reach this after
    /// the directory lookup found no key and [`Self::load_private_key`]
    /// returned `Ok(None)`.
    pub async fn generate_identity(&self) -> Result<PublicKeyMaterial> {
        let vault = Arc::clone(&self.vault);
        let user_id = self.user_id.clone();

        let public_key = tokio::task::spawn_blocking(move || {
            let handle = PrivateKeyHandle::generate();
            vault
                .save(&user_id, &handle)
                .map_err(|e| E2eError::KeyGenerationFailure(e.to_string()))?;
            Ok::<_, E2eError>(handle.public_key())
        })
        .await
        .map_err(|e| E2eError::KeyGenerationFailure(e.to_string()))??;

        info!(
            user_id = %self.user_id,
            fingerprint = %public_key.fingerprint(),
            "Generated identity keypair"
        );
        Ok(public_key)
    }

    /// Load this device's private key. `Ok(None)` means the vault holds no
    /// key; an unreadable vault is an error, not an absent key.
    pub async fn load_private_key(&self) -> Result<Option<PrivateKeyHandle>> {
        let vault = Arc::clone(&self.vault);
        let user_id = self.user_id.clone();

        tokio::task::spawn_blocking(move || vault.load(&user_id))
            .await
            .map_err(|e| E2eError::Vault(format!("private key load task failed: {e}")))?
    }

    /// This device's private key, if one can be loaded. Never generates.
    pub async fn local_private_key(&self) -> Option<PrivateKeyHandle> {
        match self.load_private_key().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Failed to load private key");
                None
            }
        }
    }

    /// Remove this device's private key from the vault.
    pub async fn delete_private_key(&self) -> Result<()> {
        let vault = Arc::clone(&self.vault);
        let user_id = self.user_id.clone();

        tokio::task::spawn_blocking(move || vault.delete(&user_id))
            .await
            .map_err(|e| E2eError::Vault(format!("private key delete task failed: {e}")))??;
        info!(user_id = %self.user_id, "Deleted local private key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::storage::{FileVault, MemoryVault};

    struct BrokenVault;

    impl KeyVault for BrokenVault {
        fn save(&self, _user_id: &str, _key: &PrivateKeyHandle) -> Result<()> {
            Err(E2eError::Vault("keychain locked".to_string()))
        }

        fn load(&self, _user_id: &str) -> Result<Option<PrivateKeyHandle>> {
            Err(E2eError::Vault("keychain locked".to_string()))
        }

        fn delete(&self, _user_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_no_key_on_fresh_device() {
        let store = IdentityKeyStore::new("alice", Arc::new(MemoryVault::new()));
        assert!(store.local_private_key().await.is_none());
    }

    #[tokio::test]
    async fn test_generate_persists_private_half() {
        let store = IdentityKeyStore::new("alice", Arc::new(MemoryVault::new()));
        let public = store.generate_identity().await.unwrap();

        let private = store.local_private_key().await.unwrap();
        assert_eq!(private.public_key(), public);
    }

    #[tokio::test]
    async fn test_local_private_key_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityKeyStore::new("alice", Arc::new(FileVault::new(dir.path())));
        let public = store.generate_identity().await.unwrap();

        let first = store.local_private_key().await.unwrap();
        let second = store.local_private_key().await.unwrap();
        assert_eq!(first.public_key(), public);
        assert_eq!(second.public_key(), public);
    }

    #[tokio::test]
    async fn test_unreadable_vault_is_an_error_not_absence() {
        let store = IdentityKeyStore::new("alice", Arc::new(BrokenVault));
        assert!(matches!(store.load_private_key().await, Err(E2eError::Vault(_))));
    }

    #[tokio::test]
    async fn test_delete_private_key() {
        let store = IdentityKeyStore::new("alice", Arc::new(MemoryVault::new()));
        store.generate_identity().await.unwrap();

        store.delete_private_key().await.unwrap();
        assert_eq!(store.load_private_key().await.unwrap().map(|k| k.public_key()), None);
    }

    #[tokio::test]
    async fn test_vault_failure_is_key_generation_failure() {
        let store = IdentityKeyStore::new("alice", Arc::new(BrokenVault));
        assert!(matches!(
            store.generate_identity().await,
            Err(E2eError::KeyGenerationFailure(_))
        ));
        assert!(store.local_private_key().await.is_none());
    }
}
