use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;

use crate::error::Result;

pub struct Database(Mutex<Connection>);

impl Database {
    /// Open (creating if needed) the database at `path` and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self(Mutex::new(conn)))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self(Mutex::new(conn)))
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        -- Published identity keys (public halves only, JWK text)
        CREATE TABLE IF NOT EXISTS public_keys (
            user_id TEXT PRIMARY KEY,
            public_key TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Channels; encryption is fixed once grants or messages exist
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            encryption_enabled INTEGER NOT NULL DEFAULT 0,
            created_by TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        -- Channel key wrapped for one member (base64)
        CREATE TABLE IF NOT EXISTS channel_grants (
            channel_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            wrapped_key TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (channel_id, user_id)
        );

        -- Messages; content is base64 ciphertext when is_encrypted = 1
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL REFERENCES channels(id),
            sender_id TEXT NOT NULL,
            content TEXT NOT NULL,
            is_encrypted INTEGER NOT NULL DEFAULT 0,
            payload TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel_id ON messages(channel_id);
        CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
        ",
    )?;
    Ok(())
}
