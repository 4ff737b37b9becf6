//! Cryptographic building blocks: identity keys, key wrapping, message cipher.

mod cipher;
mod identity;
mod storage;
mod types;
mod wrap;

pub use cipher::{EncodedPayload, EncryptedPayload, MessageCipher, NONCE_SIZE};
pub use identity::IdentityKeyStore;
pub use storage::{FileVault, KeyVault, KeyringVault, MemoryVault};
pub use types::{ChannelKey, PrivateKeyHandle, PublicKeyMaterial, WrappedKey, CHANNEL_KEY_LEN};
pub use wrap::{unwrap_channel_key, wrap_channel_key, KeyUnwrapper, LocalUnwrapper, WRAPPED_KEY_LEN};
