//! Huddle end-to-end encryption core.
//!
//! Per-user X25519 identity keys, per-channel AES-256-GCM keys distributed as
//! wrapped grants, and a session cache of unwrapped keys. Applications use
//! [`E2eClient`]; the backend is reached through [`IdentityDirectory`] and
//! [`GrantStore`].

pub mod backend;
mod cache;
mod client;
pub mod config;
pub mod crypto;
mod error;
pub mod models;
mod provision;
pub mod telemetry;

pub use backend::{GrantStore, IdentityDirectory, MemoryBackend};
pub use cache::SessionKeyCache;
pub use client::{E2eClient, IdentityStatus};
pub use config::{E2eConfig, KeyStorageKind};
pub use error::{E2eError, Result};
pub use models::input::{OutgoingFile, OutgoingMessage};
pub use models::{
    Channel, DecryptedFile, DecryptedMessage, FileAttachment, MessageBody, MessagePayload,
    MessageRow, UndecryptableReason, UNDECRYPTABLE_PLACEHOLDER,
};
pub use provision::{
    provision_channel, ChannelEncryption, ChannelKeyProvisioner, MemberKey, ProvisionReport,
    ProvisionedChannel,
};
