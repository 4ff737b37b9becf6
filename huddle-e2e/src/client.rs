//! Session facade. Application code talks to the encryption core only through
//! [`E2eClient`].

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::{GrantStore, IdentityDirectory};
use crate::cache::SessionKeyCache;
use crate::crypto::{
    wrap_channel_key, ChannelKey, IdentityKeyStore, KeyVault, LocalUnwrapper, MessageCipher,
};
use crate::error::{E2eError, Result};
use crate::models::input::{MemberInput, OutgoingMessage, ProvisionInput, ValidateExt};
use crate::models::{
    Channel, DecryptedFile, DecryptedMessage, FileAttachment, MessageBody, MessagePayload,
    MessageRow, UndecryptableReason,
};
use crate::provision::{ChannelEncryption, ChannelKeyProvisioner};

/// Outcome of [`E2eClient::ensure_identity_published`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    /// Directory and device agree on this user's key.
    Ready,
    /// A key is published but this device does not hold its private half.
    NoLocalKey,
    /// The device already had a key; it has now been published.
    Published,
    /// A new keypair was generated and published.
    Generated,
    /// Directory or key storage failed. The session continues without encryption.
    Unavailable,
}

impl IdentityStatus {
    /// Whether this device can open grants wrapped for the published key.
    pub fn can_decrypt(self) -> bool {
        matches!(self, Self::Ready | Self::Published | Self::Generated)
    }
}

/// One user's encryption session against a directory and grant store.
pub struct E2eClient {
    user_id: String,
    identity: IdentityKeyStore,
    directory: Arc<dyn IdentityDirectory>,
    grants: Arc<dyn GrantStore>,
    provisioner: ChannelKeyProvisioner,
    cache: SessionKeyCache,
    identity_status: OnceCell<IdentityStatus>,
    channels: DashMap<String, Arc<OnceCell<ChannelEncryption>>>,
}

impl E2eClient {
    pub fn new(
        user_id: impl Into<String>,
        vault: Arc<dyn KeyVault>,
        directory: Arc<dyn IdentityDirectory>,
        grants: Arc<dyn GrantStore>,
    ) -> Self {
        let user_id = user_id.into();
        let identity = IdentityKeyStore::new(user_id.clone(), vault);
        let unwrapper = Arc::new(LocalUnwrapper::new(identity.clone()));
        let cache = SessionKeyCache::new(user_id.clone(), Arc::clone(&grants), unwrapper);
        let provisioner = ChannelKeyProvisioner::new(
            identity.clone(),
            Arc::clone(&directory),
            Arc::clone(&grants),
        );

        Self {
            user_id,
            identity,
            directory,
            grants,
            provisioner,
            cache,
            identity_status: OnceCell::new(),
            channels: DashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Make sure this user has a published identity key.
    ///
    /// Runs once per client; later calls return the first outcome. A key that
    /// is already on record is never replaced.
    pub async fn ensure_identity_published(&self) -> IdentityStatus {
        *self
            .identity_status
            .get_or_init(|| self.publish_identity())
            .await
    }

    /// Result of [`E2eClient::ensure_identity_published`], if it has run.
    pub fn identity_status(&self) -> Option<IdentityStatus> {
        self.identity_status.get().copied()
    }

    async fn publish_identity(&self) -> IdentityStatus {
        let published = match self.directory.get_public_key(&self.user_id).await {
            Ok(key) => key,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Identity directory unavailable");
                return IdentityStatus::Unavailable;
            }
        };
        let local = match self.identity.load_private_key().await {
            Ok(local) => local,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Key vault unreadable, leaving identity untouched");
                return IdentityStatus::Unavailable;
            }
        };

        match (published, local) {
            (Some(published), Some(local)) if local.public_key() == published => IdentityStatus::Ready,
            (Some(published), Some(_)) => {
                warn!(
                    user_id = %self.user_id,
                    published = %published.fingerprint(),
                    "Device key does not match published key"
                );
                IdentityStatus::NoLocalKey
            }
            (Some(_), None) => {
                info!(user_id = %self.user_id, "Public key on record but no private key on this device");
                IdentityStatus::NoLocalKey
            }
            (None, Some(local)) => {
                let public_key = local.public_key();
                match self.directory.set_public_key(&self.user_id, &public_key).await {
                    Ok(()) => {
                        info!(user_id = %self.user_id, fingerprint = %public_key.fingerprint(), "Published existing identity key");
                        IdentityStatus::Published
                    }
                    Err(e) => {
                        warn!(user_id = %self.user_id, error = %e, "Failed to publish identity key");
                        IdentityStatus::Unavailable
                    }
                }
            }
            (None, None) => {
                let public_key = match self.identity.generate_identity().await {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(user_id = %self.user_id, error = %e, "Identity generation failed, continuing without encryption");
                        return IdentityStatus::Unavailable;
                    }
                };
                match self.directory.set_public_key(&self.user_id, &public_key).await {
                    Ok(()) => IdentityStatus::Generated,
                    Err(e) => {
                        warn!(user_id = %self.user_id, error = %e, "Failed to publish identity key");
                        IdentityStatus::Unavailable
                    }
                }
            }
        }
    }

    /// Encryption status of `channel_id` in this session.
    pub fn channel_status(&self, channel_id: &str) -> ChannelEncryption {
        match self.channels.get(channel_id) {
            None => ChannelEncryption::Unrequested,
            Some(cell) => cell.get().copied().unwrap_or(ChannelEncryption::Provisioning),
        }
    }

    /// Resolve encryption for a channel the local user is creating.
    ///
    /// A channel that already has grants is reported as enabled and is never
    /// re-keyed, even when this user holds no grant of their own; such a user
    /// waits for [`E2eClient::grant_member`]. Otherwise a key is provisioned
    /// for `members`; when the creator cannot be given a usable grant the
    /// channel falls back to plaintext. Resolved once per session.
    pub async fn ensure_channel_provisioned(&self, channel_id: &str, members: &[String]) -> Result<Channel> {
        ProvisionInput {
            channel_id: channel_id.to_string(),
            members: members.to_vec(),
        }
        .validate_input()?;

        let cell = Arc::clone(self.channels.entry(channel_id.to_string()).or_default().value());
        let status = *cell
            .get_or_init(|| self.resolve_channel(channel_id, members))
            .await;

        Ok(Channel::new(channel_id, status.is_enabled()))
    }

    async fn resolve_channel(&self, channel_id: &str, members: &[String]) -> ChannelEncryption {
        match self.grants.list_grantees(channel_id).await {
            Ok(grantees) if grantees.iter().any(|id| *id == self.user_id) => {
                debug!(channel_id, "Channel already provisioned");
                return ChannelEncryption::Enabled;
            }
            Ok(grantees) if !grantees.is_empty() => {
                info!(channel_id, "Channel is encrypted but this user holds no grant");
                return ChannelEncryption::Enabled;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(channel_id, error = %e, "Grant lookup failed, creating channel unencrypted");
                return ChannelEncryption::DisabledFallback;
            }
        }

        match self.provisioner.provision(channel_id, members).await {
            Ok(report) => {
                for user_id in &report.skipped {
                    info!(channel_id, user_id = %user_id, "Member has no grant until granted explicitly");
                }
                self.cache.insert(channel_id, report.key);
                ChannelEncryption::Enabled
            }
            Err(E2eError::AlreadyProvisioned { .. }) => {
                info!(channel_id, "Channel was provisioned concurrently, keeping its key");
                ChannelEncryption::Enabled
            }
            Err(e) => {
                warn!(channel_id, error = %e, "Provisioning failed, creating channel unencrypted");
                ChannelEncryption::DisabledFallback
            }
        }
    }

    async fn channel_key(&self, channel_id: &str) -> Result<ChannelKey> {
        self.cache.get_or_unwrap(channel_id).await
    }

    /// Build the row to store for an outgoing message.
    ///
    /// Encrypted channels require a usable grant; there is no plaintext
    /// fallback once a channel is encrypted.
    pub async fn encrypt_outgoing(&self, channel: &Channel, message: OutgoingMessage) -> Result<MessageRow> {
        message.validate_input()?;
        if message.text.is_empty() && message.files.is_empty() {
            return Err(E2eError::InvalidInput("message has no text and no files".to_string()));
        }

        let (content, payload) = if channel.encryption_enabled {
            let key = self.channel_key(&channel.channel_id).await?;
            let cipher = MessageCipher::new(&key);

            let body = cipher.encrypt_text(&message.text)?;
            let mut files = Vec::with_capacity(message.files.len());
            for file in message.files {
                let url = cipher.encrypt_text(&file.url)?;
                files.push(FileAttachment {
                    name: file.name,
                    url: url.content,
                    mime_type: file.mime_type,
                    size: file.size,
                    iv: Some(url.iv),
                });
            }

            (
                body.content,
                MessagePayload {
                    iv: Some(body.iv),
                    files,
                    ..MessagePayload::default()
                },
            )
        } else {
            let files = message
                .files
                .into_iter()
                .map(|file| FileAttachment {
                    name: file.name,
                    url: file.url,
                    mime_type: file.mime_type,
                    size: file.size,
                    iv: None,
                })
                .collect();
            (
                message.text,
                MessagePayload {
                    files,
                    ..MessagePayload::default()
                },
            )
        };

        Ok(MessageRow {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel.channel_id.clone(),
            sender_id: self.user_id.clone(),
            content,
            is_encrypted: channel.encryption_enabled,
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Decrypt one stored row. Never fails: unreadable content becomes
    /// [`MessageBody::Undecryptable`].
    pub async fn decrypt_incoming(&self, row: &MessageRow) -> DecryptedMessage {
        let (body, files) = if !row.is_encrypted {
            let files = row
                .payload
                .files
                .iter()
                .map(|file| decrypted_file(file, Some(file.url.clone())))
                .collect();
            (MessageBody::Plain(row.content.clone()), files)
        } else {
            match self.channel_key(&row.channel_id).await {
                Ok(key) => open_row(&MessageCipher::new(&key), row),
                Err(e) => {
                    debug!(channel_id = %row.channel_id, message_id = %row.id, error = %e, "Message undecryptable");
                    let files = row
                        .payload
                        .files
                        .iter()
                        .map(|file| decrypted_file(file, None))
                        .collect();
                    (MessageBody::Undecryptable(UndecryptableReason::from(&e)), files)
                }
            }
        };

        DecryptedMessage {
            id: row.id.clone(),
            channel_id: row.channel_id.clone(),
            sender_id: row.sender_id.clone(),
            body,
            files,
            was_encrypted: row.is_encrypted,
            created_at: row.created_at,
        }
    }

    /// Decrypt a batch, preserving order. Rows of one channel share a single unwrap.
    pub async fn decrypt_history(&self, rows: &[MessageRow]) -> Vec<DecryptedMessage> {
        join_all(rows.iter().map(|row| self.decrypt_incoming(row))).await
    }

    /// Give `user_id` this channel's key (late joiner re-provisioning).
    ///
    /// The caller must hold the key; the member must have published a public key.
    pub async fn grant_member(&self, channel_id: &str, user_id: &str) -> Result<()> {
        MemberInput {
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
        }
        .validate_input()?;
        if user_id == self.user_id {
            return Err(E2eError::InvalidInput("cannot grant a channel key to yourself".to_string()));
        }

        let key = self.channel_key(channel_id).await?;
        let public_key = self
            .directory
            .get_public_key(user_id)
            .await?
            .ok_or_else(|| E2eError::InvalidInput(format!("user {user_id} has not published a public key")))?;

        let wrapped = wrap_channel_key(&key, &public_key)?;
        self.grants.put_grant(channel_id, user_id, &wrapped).await?;

        info!(channel_id, user_id, fingerprint = %public_key.fingerprint(), "Granted channel key");
        Ok(())
    }

    /// Delete `user_id`'s grant.
    ///
    /// The channel key is not rotated: a key the member already unwrapped
    /// still decrypts every message sent under it.
    pub async fn revoke_member(&self, channel_id: &str, user_id: &str) -> Result<()> {
        MemberInput {
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
        }
        .validate_input()?;

        self.grants.delete_grant(channel_id, user_id).await?;
        warn!(channel_id, user_id, "Revoked grant without key rotation");
        Ok(())
    }

    /// Forget every unwrapped key and channel status held by this session.
    pub fn end_session(&self) {
        self.cache.clear();
        self.channels.clear();
        info!(user_id = %self.user_id, "Session ended, channel keys dropped");
    }

    /// Delete this device's private key and end the session.
    ///
    /// The published public key stays on record, so later sessions on this
    /// device report [`IdentityStatus::NoLocalKey`].
    pub async fn forget_device_key(&self) -> Result<()> {
        self.identity.delete_private_key().await?;
        self.end_session();
        Ok(())
    }
}

fn decrypted_file(file: &FileAttachment, url: Option<String>) -> DecryptedFile {
    DecryptedFile {
        name: file.name.clone(),
        url,
        mime_type: file.mime_type.clone(),
        size: file.size,
    }
}

fn open_row(cipher: &MessageCipher, row: &MessageRow) -> (MessageBody, Vec<DecryptedFile>) {
    let body = match cipher.decrypt_text(&row.content, row.payload.iv.as_deref()) {
        Ok(text) => MessageBody::Plain(text),
        Err(e) => {
            warn!(channel_id = %row.channel_id, message_id = %row.id, error = %e, "Failed to decrypt message");
            MessageBody::Undecryptable(UndecryptableReason::from(&e))
        }
    };

    let files = row
        .payload
        .files
        .iter()
        .map(|file| {
            let url = cipher.decrypt_text(&file.url, file.iv.as_deref()).ok();
            if url.is_none() {
                warn!(message_id = %row.id, file = %file.name, "Failed to decrypt file reference");
            }
            decrypted_file(file, url)
        })
        .collect();

    (body, files)
}
