use serde::{Deserialize, Serialize};

/// Channel as far as encryption is concerned. `encryption_enabled` is fixed at
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub encryption_enabled: bool,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, encryption_enabled: bool) -> Self {
        Self {
            channel_id: channel_id.into(),
            encryption_enabled,
        }
    }
}
