mod channel;
pub mod input;
mod message;

pub use channel::Channel;
pub use message::{
    DecryptedFile, DecryptedMessage, FileAttachment, MessageBody, MessagePayload, MessageRow,
    UndecryptableReason, UNDECRYPTABLE_PLACEHOLDER,
};
