//! SQLite storage for Huddle: identity directory, channel key grants, channel
//! registry and encrypted message rows.
//!
//! The store only ever sees public keys, wrapped grants and ciphertext.

mod db;
mod error;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use huddle_e2e::crypto::{PublicKeyMaterial, WrappedKey};
use huddle_e2e::{Channel, GrantStore, IdentityDirectory, MessagePayload, MessageRow};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

pub use db::Database;
pub use error::{Result, StoreError};

/// Default page size for [`SqliteBackend::list_messages`].
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Clone)]
pub struct SqliteBackend {
    db: Arc<Database>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: Arc::new(Database::open(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Database::open_in_memory()?),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db.conn()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Register a channel. Fails with [`StoreError::Conflict`] if the id is taken.
    pub async fn create_channel(&self, channel: &Channel, created_by: &str) -> Result<()> {
        let channel = channel.clone();
        let created_by = created_by.to_string();

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO channels (id, encryption_enabled, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    channel.channel_id,
                    channel.encryption_enabled,
                    created_by,
                    chrono::Utc::now().timestamp_millis()
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!(
                    "channel {} already exists",
                    channel.channel_id
                )));
            }
            Ok(())
        })
        .await
    }

    /// Turn encryption off for a channel that could not be provisioned.
    ///
    /// Only a channel with no grants and no messages can fall back; once
    /// either exists the encryption flag is fixed.
    pub async fn fall_back_to_plaintext(&self, channel_id: &str) -> Result<()> {
        let channel_id = channel_id.to_string();

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE channels SET encryption_enabled = 0
                 WHERE id = ?1
                   AND NOT EXISTS (SELECT 1 FROM channel_grants WHERE channel_id = ?1)
                   AND NOT EXISTS (SELECT 1 FROM messages WHERE channel_id = ?1)",
                [&channel_id],
            )?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "channel {channel_id} is missing or already in use"
                )));
            }
            debug!(channel_id = %channel_id, "Channel fell back to plaintext");
            Ok(())
        })
        .await
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        let channel_id = channel_id.to_string();

        self.with_conn(move |conn| {
            let channel = conn
                .query_row(
                    "SELECT id, encryption_enabled FROM channels WHERE id = ?1",
                    [&channel_id],
                    |row| {
                        Ok(Channel {
                            channel_id: row.get(0)?,
                            encryption_enabled: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(channel)
        })
        .await
    }

    /// Store a new message row. Rows are immutable once written.
    pub async fn insert_message(&self, row: &MessageRow) -> Result<()> {
        if !row.is_well_formed() {
            return Err(StoreError::InvalidRow(format!(
                "message {} has is_encrypted={} but iv present={}",
                row.id,
                row.is_encrypted,
                row.payload.iv.is_some()
            )));
        }
        let row = row.clone();
        let payload = serde_json::to_string(&row.payload)?;

        self.with_conn(move |conn| {
            let encrypted: Option<bool> = conn
                .query_row(
                    "SELECT encryption_enabled FROM channels WHERE id = ?1",
                    [&row.channel_id],
                    |r| r.get(0),
                )
                .optional()?;
            match encrypted {
                None => return Err(StoreError::NotFound(format!("channel {}", row.channel_id))),
                Some(encrypted) if encrypted != row.is_encrypted => {
                    return Err(StoreError::InvalidRow(format!(
                        "message {} does not match channel encryption",
                        row.id
                    )));
                }
                Some(_) => {}
            }

            conn.execute(
                "INSERT INTO messages (id, channel_id, sender_id, content, is_encrypted, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.channel_id,
                    row.sender_id,
                    row.content,
                    row.is_encrypted,
                    payload,
                    row.created_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Messages of a channel, oldest first.
    pub async fn list_messages(&self, channel_id: &str, limit: usize, offset: usize) -> Result<Vec<MessageRow>> {
        let channel_id = channel_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel_id, sender_id, content, is_encrypted, payload, created_at
                 FROM messages
                 WHERE channel_id = ?1
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT ?2 OFFSET ?3",
            )?;

            let raw: Vec<(MessageRow, String)> = stmt
                .query_map(params![channel_id, limit as i64, offset as i64], |row| {
                    Ok((
                        MessageRow {
                            id: row.get(0)?,
                            channel_id: row.get(1)?,
                            sender_id: row.get(2)?,
                            content: row.get(3)?,
                            is_encrypted: row.get(4)?,
                            payload: MessagePayload::default(),
                            created_at: row.get(6)?,
                        },
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<_>>()?;

            raw.into_iter()
                .map(|(mut message, payload)| -> Result<MessageRow> {
                    message.payload = serde_json::from_str(&payload)?;
                    Ok(message)
                })
                .collect()
        })
        .await
    }
}

#[async_trait]
impl IdentityDirectory for SqliteBackend {
    async fn get_public_key(&self, user_id: &str) -> huddle_e2e::Result<Option<PublicKeyMaterial>> {
        let user_id = user_id.to_string();

        let jwk: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT public_key FROM public_keys WHERE user_id = ?1",
                        [&user_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        jwk.map(|jwk| PublicKeyMaterial::from_jwk(&jwk)).transpose()
    }

    async fn set_public_key(&self, user_id: &str, key: &PublicKeyMaterial) -> huddle_e2e::Result<()> {
        let user_id = user_id.to_string();
        let jwk = key.to_jwk();
        let fingerprint = key.fingerprint();

        self.with_conn(move |conn| {
            let now = chrono::Utc::now().timestamp_millis();
            conn.execute(
                "INSERT INTO public_keys (user_id, public_key, fingerprint, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    public_key = excluded.public_key,
                    fingerprint = excluded.fingerprint,
                    updated_at = excluded.updated_at",
                params![user_id, jwk, fingerprint, now],
            )?;
            debug!(user_id = %user_id, fingerprint = %fingerprint, "Stored public key");
            Ok(())
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GrantStore for SqliteBackend {
    async fn get_grant(&self, channel_id: &str, user_id: &str) -> huddle_e2e::Result<Option<WrappedKey>> {
        let channel_id = channel_id.to_string();
        let user_id = user_id.to_string();

        let encoded: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT wrapped_key FROM channel_grants WHERE channel_id = ?1 AND user_id = ?2",
                        [&channel_id, &user_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        encoded.map(|blob| WrappedKey::from_base64(&blob)).transpose()
    }

    async fn put_grant(&self, channel_id: &str, user_id: &str, wrapped: &WrappedKey) -> huddle_e2e::Result<()> {
        let channel_id = channel_id.to_string();
        let user_id = user_id.to_string();
        let encoded = wrapped.to_base64();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO channel_grants (channel_id, user_id, wrapped_key, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![channel_id, user_id, encoded, chrono::Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn insert_grant(&self, channel_id: &str, user_id: &str, wrapped: &WrappedKey) -> huddle_e2e::Result<bool> {
        let channel_id = channel_id.to_string();
        let user_id = user_id.to_string();
        let encoded = wrapped.to_base64();

        let inserted = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO channel_grants (channel_id, user_id, wrapped_key, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![channel_id, user_id, encoded, chrono::Utc::now().timestamp_millis()],
                )?)
            })
            .await?;
        Ok(inserted == 1)
    }

    async fn delete_grant(&self, channel_id: &str, user_id: &str) -> huddle_e2e::Result<()> {
        let channel_id = channel_id.to_string();
        let user_id = user_id.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM channel_grants WHERE channel_id = ?1 AND user_id = ?2",
                [&channel_id, &user_id],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn list_grantees(&self, channel_id: &str) -> huddle_e2e::Result<Vec<String>> {
        let channel_id = channel_id.to_string();

        let users = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id FROM channel_grants WHERE channel_id = ?1 ORDER BY user_id",
                )?;
                let users = stmt
                    .query_map([&channel_id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(users)
            })
            .await?;
        Ok(users)
    }
}
