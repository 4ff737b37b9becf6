//! Runtime configuration read from the environment (and `.env` if present).

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::crypto::{FileVault, KeyVault, KeyringVault, MemoryVault};
use crate::error::{E2eError, Result};

const DEFAULT_KEY_DIR: &str = ".huddle/keys";
const DEFAULT_KEYRING_SERVICE: &str = "huddle-chat";
const DEFAULT_DB_PATH: &str = "huddle.db";

/// Where identity private keys are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStorageKind {
    /// OS credential store.
    #[default]
    Keyring,
    /// One 0600 file per user under the key directory.
    File,
    /// Process memory only. Keys die with the process.
    Memory,
}

impl FromStr for KeyStorageKind {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(E2eError::Config(format!(
                "unknown key storage '{other}' (expected keyring, file or memory)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct E2eConfig {
    pub key_storage: KeyStorageKind,
    pub key_dir: PathBuf,
    pub keyring_service: String,
    pub db_path: PathBuf,
}

impl Default for E2eConfig {
    fn default() -> Self {
        Self {
            key_storage: KeyStorageKind::default(),
            key_dir: PathBuf::from(DEFAULT_KEY_DIR),
            keyring_service: DEFAULT_KEYRING_SERVICE.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

impl E2eConfig {
    /// Loads `.env` (if any) and reads `HUDDLE_*` variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(kind) = lookup("HUDDLE_KEY_STORAGE") {
            config.key_storage = kind.parse()?;
        }
        if let Some(dir) = lookup("HUDDLE_KEY_DIR").filter(|v| !v.is_empty()) {
            config.key_dir = PathBuf::from(dir);
        }
        if let Some(service) = lookup("HUDDLE_KEYRING_SERVICE").filter(|v| !v.is_empty()) {
            config.keyring_service = service;
        }
        if let Some(path) = lookup("HUDDLE_DB_PATH").filter(|v| !v.is_empty()) {
            config.db_path = PathBuf::from(path);
        }

        Ok(config)
    }

    /// Opens the key vault this config selects.
    pub fn open_vault(&self) -> Arc<dyn KeyVault> {
        let vault: Arc<dyn KeyVault> = match self.key_storage {
            KeyStorageKind::Keyring => Arc::new(KeyringVault::new(&self.keyring_service)),
            KeyStorageKind::File => Arc::new(FileVault::new(&self.key_dir)),
            KeyStorageKind::Memory => Arc::new(MemoryVault::new()),
        };
        vault
    }
}
