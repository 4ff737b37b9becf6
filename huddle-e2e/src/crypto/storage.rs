//! Device-local storage for identity private keys.
//!
//! Private keys only ever land in one of these vaults. None of them is
//! reachable over the network.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use keyring::Entry;
use zeroize::{Zeroize, Zeroizing};

use super::types::{PrivateKeyHandle, X25519_KEY_LEN};
use crate::error::{E2eError, Result};

const KEYRING_IDENTITY_PREFIX: &str = "identity-key-";

/// Durable, device-local home for a user's identity private key.
pub trait KeyVault: Send + Sync {
    fn save(&self, user_id: &str, key: &PrivateKeyHandle) -> Result<()>;

    /// `Ok(None)` when no key exists for the user on this device.
    fn load(&self, user_id: &str) -> Result<Option<PrivateKeyHandle>>;

    /// Removing a key orphans every channel key wrapped for it.
    fn delete(&self, user_id: &str) -> Result<()>;
}

/// OS keyring (Windows Credential Manager, macOS Keychain, Linux Secret Service).
pub struct KeyringVault {
    service: String,
}

impl KeyringVault {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, user_id: &str) -> Result<Entry> {
        Entry::new(&self.service, &format!("{KEYRING_IDENTITY_PREFIX}{user_id}"))
            .map_err(|e| E2eError::Vault(format!("Failed to create keyring entry: {e}")))
    }
}

impl KeyVault for KeyringVault {
    fn save(&self, user_id: &str, key: &PrivateKeyHandle) -> Result<()> {
        // keyring stores strings
        let key_hex = Zeroizing::new(hex::encode(key.secret_bytes().as_slice()));
        self.entry(user_id)?
            .set_password(&key_hex)
            .map_err(|e| E2eError::Vault(format!("Failed to store private key: {e}")))
    }

    fn load(&self, user_id: &str) -> Result<Option<PrivateKeyHandle>> {
        match self.entry(user_id)?.get_password() {
            Ok(key_hex) => {
                let key_hex = Zeroizing::new(key_hex);
                let key_bytes = Zeroizing::new(hex::decode(key_hex.as_str()).map_err(|e| {
                    E2eError::Vault(format!("Invalid key format in keyring: {e}"))
                })?);
                PrivateKeyHandle::from_secret_bytes(&key_bytes).map(Some)
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(E2eError::Vault(format!(
                "Failed to retrieve private key: {e}"
            ))),
        }
    }

    fn delete(&self, user_id: &str) -> Result<()> {
        match self.entry(user_id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(E2eError::Vault(format!("Failed to delete private key: {e}"))),
        }
    }
}

/// One raw 32-byte key file per user, owner-only permissions on Unix.
pub struct FileVault {
    dir: PathBuf,
}

impl FileVault {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, user_id: &str) -> PathBuf {
        // user ids are hex-encoded so they can never escape the vault directory
        self.dir.join(format!("{}.key", hex::encode(user_id.as_bytes())))
    }

    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let mode = std::fs::metadata(path).map_err(io_error)?.permissions().mode() & 0o777;
        if mode != 0o600 {
            return Err(E2eError::Vault(format!(
                "Identity key file has insecure permissions: {mode:o} (expected 600)"
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }
}

fn io_error(e: std::io::Error) -> E2eError {
    E2eError::Vault(e.to_string())
}

impl KeyVault for FileVault {
    fn save(&self, user_id: &str, key: &PrivateKeyHandle) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(io_error)?;
        let path = self.key_path(user_id);

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            options.mode(0o600);
            // mode() only applies on creation
            if path.exists() {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                    .map_err(io_error)?;
            }
        }

        let mut file = options.open(&path).map_err(io_error)?;
        file.write_all(key.secret_bytes().as_slice()).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        Ok(())
    }

    fn load(&self, user_id: &str) -> Result<Option<PrivateKeyHandle>> {
        let path = self.key_path(user_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::check_permissions(&path)?;

        let mut file = std::fs::File::open(&path).map_err(io_error)?;
        let mut buf = [0u8; X25519_KEY_LEN];
        file.read_exact(&mut buf).map_err(io_error)?;
        let result = PrivateKeyHandle::from_secret_bytes(&buf);
        buf.zeroize();
        result.map(Some)
    }

    fn delete(&self, user_id: &str) -> Result<()> {
        match std::fs::remove_file(self.key_path(user_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }
}

/// Process-local vault. Keys vanish with the process.
#[derive(Default)]
pub struct MemoryVault {
    keys: Mutex<HashMap<String, PrivateKeyHandle>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyVault for MemoryVault {
    fn save(&self, user_id: &str, key: &PrivateKeyHandle) -> Result<()> {
        self.keys
            .lock()
            .map_err(|e| E2eError::Vault(e.to_string()))?
            .insert(user_id.to_string(), key.clone());
        Ok(())
    }

    fn load(&self, user_id: &str) -> Result<Option<PrivateKeyHandle>> {
        Ok(self
            .keys
            .lock()
            .map_err(|e| E2eError::Vault(e.to_string()))?
            .get(user_id)
            .cloned())
    }

    fn delete(&self, user_id: &str) -> Result<()> {
        self.keys
            .lock()
            .map_err(|e| E2eError::Vault(e.to_string()))?
            .remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_vault_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::new(dir.path());
        let key = PrivateKeyHandle::generate();

        assert!(vault.load("alice").unwrap().is_none());
        vault.save("alice", &key).unwrap();

        let loaded = vault.load("alice").unwrap().unwrap();
        assert_eq!(loaded.public_key(), key.public_key());
        assert!(vault.load("bob").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_vault_writes_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::new(dir.path());
        vault.save("alice", &PrivateKeyHandle::generate()).unwrap();

        let perms = std::fs::metadata(vault.key_path("alice")).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_vault_rejects_world_readable_key() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::new(dir.path());
        vault.save("alice", &PrivateKeyHandle::generate()).unwrap();
        std::fs::set_permissions(
            vault.key_path("alice"),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        assert!(matches!(vault.load("alice"), Err(E2eError::Vault(_))));
    }

    #[test]
    fn test_file_vault_truncated_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::new(dir.path());
        vault.save("alice", &PrivateKeyHandle::generate()).unwrap();
        std::fs::write(vault.key_path("alice"), [0u8; 20]).unwrap();

        assert!(vault.load("alice").is_err());
    }

    #[test]
    fn test_file_vault_path_stays_inside_dir() {
        let vault = FileVault::new("/tmp/vault");
        let path = vault.key_path("../../etc/passwd");
        assert_eq!(path.parent(), Some(Path::new("/tmp/vault")));
    }

    #[test]
    fn test_file_vault_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::new(dir.path());
        vault.save("alice", &PrivateKeyHandle::generate()).unwrap();

        vault.delete("alice").unwrap();
        vault.delete("alice").unwrap();
        assert!(vault.load("alice").unwrap().is_none());
    }

    #[test]
    fn test_memory_vault_isolates_users() {
        let vault = MemoryVault::new();
        let alice = PrivateKeyHandle::generate();
        vault.save("alice", &alice).unwrap();

        assert_eq!(vault.load("alice").unwrap().unwrap().public_key(), alice.public_key());
        assert!(vault.load("bob").unwrap().is_none());

        vault.delete("alice").unwrap();
        assert!(vault.load("alice").unwrap().is_none());
    }
}
