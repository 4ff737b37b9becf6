use serde::{Deserialize, Serialize};

use crate::error::E2eError;

/// Shown in place of content that exists but cannot be read on this device.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "🔒 Encrypted message (cannot be decrypted on this device)";

/// A message as stored by the backend.
///
/// When `is_encrypted` is true, `content` is base64 ciphertext and
/// `payload.iv` holds the base64 nonce. Both are always present together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub content: String,
    pub is_encrypted: bool,
    #[serde(default)]
    pub payload: MessagePayload,
    pub created_at: i64,
}

impl MessageRow {
    /// Encrypted rows carry a nonce; plaintext rows do not.
    pub fn is_well_formed(&self) -> bool {
        self.is_encrypted == self.payload.iv.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileAttachment>,
    /// Payload fields owned by other parts of the application.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Reference to a file in blob storage.
///
/// In encrypted messages only `url` is encrypted (under its own `iv`); the
/// blob itself stays unencrypted at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

/// Why a message could not be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndecryptableReason {
    /// No private key on this device.
    MissingPrivateKey,
    /// No grant for this user in the channel.
    MissingGrant,
    /// The grant was sealed for another key.
    KeyMismatch,
    /// Ciphertext, nonce or key did not authenticate.
    Corrupted,
    /// Backend or local storage failure.
    Unavailable,
}

impl From<&E2eError> for UndecryptableReason {
    fn from(error: &E2eError) -> Self {
        match error {
            E2eError::MissingPrivateKey => Self::MissingPrivateKey,
            E2eError::MissingGrant { .. } => Self::MissingGrant,
            E2eError::KeyMismatch => Self::KeyMismatch,
            E2eError::DecryptionFailed | E2eError::InvalidEncoding(_) => Self::Corrupted,
            _ => Self::Unavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageBody {
    Plain(String),
    Undecryptable(UndecryptableReason),
}

impl MessageBody {
    /// Text to display: the content, or the undecryptable placeholder.
    pub fn render(&self) -> &str {
        match self {
            Self::Plain(text) => text,
            Self::Undecryptable(_) => UNDECRYPTABLE_PLACEHOLDER,
        }
    }

    pub fn is_readable(&self) -> bool {
        matches!(self, Self::Plain(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedFile {
    pub name: String,
    /// `None` when the reference could not be decrypted.
    pub url: Option<String>,
    pub mime_type: String,
    pub size: u64,
}

/// A message ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedMessage {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub body: MessageBody,
    pub files: Vec<DecryptedFile>,
    pub was_encrypted: bool,
    pub created_at: i64,
}
