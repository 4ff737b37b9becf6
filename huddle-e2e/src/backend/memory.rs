use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use super::{GrantStore, IdentityDirectory};
use crate::crypto::{PublicKeyMaterial, WrappedKey};
use crate::error::{E2eError, Result};

/// In-process backend for tests and offline sessions.
///
/// Can be told to fail specific writes to exercise degraded paths.
#[derive(Default)]
pub struct MemoryBackend {
    /// user_id -> published public key
    public_keys: DashMap<String, PublicKeyMaterial>,
    /// (channel_id, user_id) -> wrapped channel key
    grants: DashMap<(String, String), WrappedKey>,
    failing_grant_users: DashSet<String>,
    directory_offline: AtomicBool,
    grant_reads: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every grant write for `user_id` fail.
    pub fn fail_puts_for(&self, user_id: &str) {
        self.failing_grant_users.insert(user_id.to_string());
    }

    /// Make every directory call fail, as if the network were down.
    pub fn set_directory_offline(&self, offline: bool) {
        self.directory_offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `get_grant` calls served so far.
    pub fn grant_reads(&self) -> usize {
        self.grant_reads.load(Ordering::SeqCst)
    }

    fn check_grant_write(&self, user_id: &str) -> Result<()> {
        if self.failing_grant_users.contains(user_id) {
            Err(E2eError::Backend(format!("grant write rejected for {user_id}")))
        } else {
            Ok(())
        }
    }

    fn check_directory(&self) -> Result<()> {
        if self.directory_offline.load(Ordering::SeqCst) {
            Err(E2eError::Backend("identity directory unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IdentityDirectory for MemoryBackend {
    async fn get_public_key(&self, user_id: &str) -> Result<Option<PublicKeyMaterial>> {
        self.check_directory()?;
        Ok(self.public_keys.get(user_id).map(|key| *key))
    }

    async fn set_public_key(&self, user_id: &str, key: &PublicKeyMaterial) -> Result<()> {
        self.check_directory()?;
        self.public_keys.insert(user_id.to_string(), *key);
        debug!(user_id, "Stored public key");
        Ok(())
    }
}

#[async_trait]
impl GrantStore for MemoryBackend {
    async fn get_grant(&self, channel_id: &str, user_id: &str) -> Result<Option<WrappedKey>> {
        self.grant_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .grants
            .get(&(channel_id.to_string(), user_id.to_string()))
            .map(|grant| grant.clone()))
    }

    async fn put_grant(&self, channel_id: &str, user_id: &str, wrapped: &WrappedKey) -> Result<()> {
        self.check_grant_write(user_id)?;
        self.grants
            .insert((channel_id.to_string(), user_id.to_string()), wrapped.clone());
        Ok(())
    }

    async fn insert_grant(&self, channel_id: &str, user_id: &str, wrapped: &WrappedKey) -> Result<bool> {
        self.check_grant_write(user_id)?;
        match self.grants.entry((channel_id.to_string(), user_id.to_string())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(wrapped.clone());
                Ok(true)
            }
        }
    }

    async fn delete_grant(&self, channel_id: &str, user_id: &str) -> Result<()> {
        self.grants
            .remove(&(channel_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn list_grantees(&self, channel_id: &str) -> Result<Vec<String>> {
        let mut users: Vec<String> = self
            .grants
            .iter()
            .filter(|entry| entry.key().0 == channel_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        users.sort();
        Ok(users)
    }
}
