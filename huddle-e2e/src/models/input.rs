//! Input DTOs with garde validation for the client entry points.

use garde::Validate;
use serde::Deserialize;

use crate::error::E2eError;

/// Validation constants
const MAX_ID_LENGTH: usize = 256;
const MAX_MESSAGE_LENGTH: usize = 10000;
const MAX_ATTACHMENTS: usize = 10;
const MAX_MEMBERS: usize = 1000;
const MAX_URL_LENGTH: usize = 2048;

/// Message about to be sent.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[garde(context(()))]
pub struct OutgoingMessage {
    #[garde(length(max = MAX_MESSAGE_LENGTH))]
    pub text: String,
    #[garde(length(max = MAX_ATTACHMENTS), dive)]
    #[serde(default)]
    pub files: Vec<OutgoingFile>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, file: OutgoingFile) -> Self {
        self.files.push(file);
        self
    }
}

/// Reference to an already uploaded blob.
#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(()))]
pub struct OutgoingFile {
    #[garde(length(min = 1, max = 255))]
    pub name: String,
    #[garde(length(min = 1, max = MAX_URL_LENGTH))]
    pub url: String,
    #[garde(length(max = 127))]
    pub mime_type: String,
    #[garde(skip)]
    pub size: u64,
}

/// Input for provisioning a channel
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct ProvisionInput {
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub channel_id: String,
    /// Other members; the creator is always included.
    #[garde(length(max = MAX_MEMBERS), inner(length(min = 1, max = MAX_ID_LENGTH)))]
    pub members: Vec<String>,
}

/// Input naming one channel member
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct MemberInput {
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub channel_id: String,
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub user_id: String,
}

/// Helper trait to convert garde validation errors into [`E2eError`]
pub trait ValidateExt {
    fn validate_input(&self) -> Result<(), E2eError>;
}

impl<T: Validate<Context = ()>> ValidateExt for T {
    fn validate_input(&self) -> Result<(), E2eError> {
        self.validate()
            .map_err(|e| E2eError::InvalidInput(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(url: &str) -> OutgoingFile {
        OutgoingFile {
            name: "cat.gif".to_string(),
            url: url.to_string(),
            mime_type: "image/gif".to_string(),
            size: 10,
        }
    }

    #[test]
    fn test_valid_message() {
        let msg = OutgoingMessage::text("hello team").with_file(file("https://cdn/cat.gif"));
        assert!(msg.validate_input().is_ok());
    }

    #[test]
    fn test_message_too_long() {
        let msg = OutgoingMessage::text("x".repeat(MAX_MESSAGE_LENGTH + 1));
        assert!(matches!(msg.validate_input(), Err(E2eError::InvalidInput(_))));
    }

    #[test]
    fn test_too_many_files() {
        let mut msg = OutgoingMessage::text("spam");
        for _ in 0..=MAX_ATTACHMENTS {
            msg = msg.with_file(file("https://cdn/x"));
        }
        assert!(msg.validate_input().is_err());
    }

    #[test]
    fn test_file_with_empty_url() {
        let msg = OutgoingMessage::text("").with_file(file(""));
        assert!(msg.validate_input().is_err());
    }

    #[test]
    fn test_provision_input_rejects_empty_member() {
        let input = ProvisionInput {
            channel_id: "general".to_string(),
            members: vec!["alice".to_string(), String::new()],
        };
        assert!(input.validate_input().is_err());

        let creator_only = ProvisionInput {
            channel_id: "notes".to_string(),
            members: Vec::new(),
        };
        assert!(creator_only.validate_input().is_ok());
    }
}
