//! Channel key provisioning: one fresh key per encrypted channel, wrapped for
//! every member that has published a public key.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{GrantStore, IdentityDirectory};
use crate::crypto::{wrap_channel_key, ChannelKey, IdentityKeyStore, PublicKeyMaterial, WrappedKey};
use crate::error::{E2eError, Result};

/// Encryption status of a channel within this session.
///
/// `Unrequested -> Provisioning -> Enabled | DisabledFallback`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEncryption {
    Unrequested,
    Provisioning,
    Enabled,
    DisabledFallback,
}

impl ChannelEncryption {
    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

/// A member as seen by the provisioner.
#[derive(Debug, Clone)]
pub struct MemberKey {
    pub user_id: String,
    pub public_key: Option<PublicKeyMaterial>,
}

/// Output of [`provision_channel`].
#[derive(Debug)]
pub struct ProvisionedChannel {
    pub key: ChannelKey,
    pub grants: Vec<(String, WrappedKey)>,
    /// Members without a published key, or whose key could not be wrapped.
    pub skipped: Vec<String>,
}

/// Generate a channel key and wrap it for each member with a public key.
///
/// Fails when the creator cannot be given a grant; members without keys are
/// skipped and stay unable to decrypt until granted explicitly.
pub fn provision_channel(creator_id: &str, members: &[MemberKey]) -> Result<ProvisionedChannel> {
    let creator = members
        .iter()
        .find(|m| m.user_id == creator_id)
        .ok_or_else(|| E2eError::InvalidInput(format!("creator {creator_id} is not a member")))?;
    let creator_public = creator.public_key.ok_or_else(|| {
        E2eError::KeyGenerationFailure(format!("creator {creator_id} has no public key"))
    })?;

    let key = ChannelKey::generate();
    let creator_grant = wrap_channel_key(&key, &creator_public)
        .map_err(|e| E2eError::KeyGenerationFailure(format!("creator key wrap failed: {e}")))?;

    let mut grants = vec![(creator_id.to_string(), creator_grant)];
    let mut skipped = Vec::new();

    for member in members.iter().filter(|m| m.user_id != creator_id) {
        let Some(public_key) = member.public_key else {
            warn!(user_id = %member.user_id, "Member has no public key, skipping grant");
            skipped.push(member.user_id.clone());
            continue;
        };
        match wrap_channel_key(&key, &public_key) {
            Ok(wrapped) => grants.push((member.user_id.clone(), wrapped)),
            Err(e) => {
                warn!(user_id = %member.user_id, error = %e, "Key wrap failed, skipping grant");
                skipped.push(member.user_id.clone());
            }
        }
    }

    Ok(ProvisionedChannel { key, grants, skipped })
}

/// Summary of a completed provisioning run.
#[derive(Debug)]
pub struct ProvisionReport {
    pub key: ChannelKey,
    pub granted: Vec<String>,
    pub skipped: Vec<String>,
}

/// Provisions channels against the directory and grant store.
pub struct ChannelKeyProvisioner {
    identity: IdentityKeyStore,
    directory: Arc<dyn IdentityDirectory>,
    grants: Arc<dyn GrantStore>,
}

impl ChannelKeyProvisioner {
    pub fn new(
        identity: IdentityKeyStore,
        directory: Arc<dyn IdentityDirectory>,
        grants: Arc<dyn GrantStore>,
    ) -> Self {
        Self {
            identity,
            directory,
            grants,
        }
    }

    /// Provision `channel_id` for `members` (the local user is the creator).
    ///
    /// Refused with [`E2eError::AlreadyProvisioned`] once any member holds a
    /// grant. The creator's grant is wrapped for this device's own key and
    /// written first; if that fails nothing else is written and the caller
    /// must create the channel unencrypted. Grants are written insert-only,
    /// so a concurrent provisioner can never replace one.
    pub async fn provision(&self, channel_id: &str, members: &[String]) -> Result<ProvisionReport> {
        let creator_id = self.identity.user_id().to_string();
        let already_provisioned = || E2eError::AlreadyProvisioned {
            channel_id: channel_id.to_string(),
        };

        if !self.grants.list_grantees(channel_id).await?.is_empty() {
            return Err(already_provisioned());
        }

        let local_key = self
            .identity
            .local_private_key()
            .await
            .ok_or(E2eError::MissingPrivateKey)?;

        let mut member_keys = vec![MemberKey {
            user_id: creator_id.clone(),
            public_key: Some(local_key.public_key()),
        }];
        for user_id in members.iter().filter(|id| **id != creator_id) {
            if member_keys.iter().any(|m| m.user_id == *user_id) {
                continue;
            }
            let public_key = match self.directory.get_public_key(user_id).await {
                Ok(key) => key,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Public key lookup failed");
                    None
                }
            };
            member_keys.push(MemberKey {
                user_id: user_id.clone(),
                public_key,
            });
        }

        let provisioned = provision_channel(&creator_id, &member_keys)?;
        let mut grants = provisioned.grants.into_iter();
        let mut skipped = provisioned.skipped;
        let mut granted = Vec::new();

        if let Some((user_id, wrapped)) = grants.next() {
            let inserted = self
                .grants
                .insert_grant(channel_id, &user_id, &wrapped)
                .await
                .map_err(|e| E2eError::KeyGenerationFailure(format!("creator grant not stored: {e}")))?;
            if !inserted {
                return Err(already_provisioned());
            }
            granted.push(user_id);
        }

        for (user_id, wrapped) in grants {
            match self.grants.insert_grant(channel_id, &user_id, &wrapped).await {
                Ok(true) => granted.push(user_id),
                Ok(false) => {
                    warn!(channel_id, user_id = %user_id, "Member already holds a grant, left unchanged");
                    skipped.push(user_id);
                }
                Err(e) => {
                    warn!(channel_id, user_id = %user_id, error = %e, "Failed to store grant");
                    skipped.push(user_id);
                }
            }
        }

        info!(
            channel_id,
            granted = granted.len(),
            skipped = skipped.len(),
            "Provisioned channel key"
        );

        Ok(ProvisionReport {
            key: provisioned.key,
            granted,
            skipped,
        })
    }
}
