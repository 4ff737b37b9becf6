//! Key wrap/unwrap: seal a channel key for one recipient's public key.
//!
//! Blob layout: `version(1) | ephemeral_pub(32) | nonce(12) | ciphertext+tag(48)`.
//! The wrapping key is HKDF-SHA256 over the X25519 shared secret, salted with
//! both public keys so a blob only opens for the identity it was sealed to.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use super::identity::IdentityKeyStore;
use super::types::{
    ChannelKey, PrivateKeyHandle, PublicKeyMaterial, WrappedKey, CHANNEL_KEY_LEN, X25519_KEY_LEN,
};
use crate::error::{E2eError, Result};

const WRAP_VERSION: u8 = 1;
const WRAP_INFO: &[u8] = b"huddle-channel-key-wrap-v1";
const WRAP_NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Total size of a version-1 wrapped key blob.
pub const WRAPPED_KEY_LEN: usize = 1 + X25519_KEY_LEN + WRAP_NONCE_LEN + CHANNEL_KEY_LEN + TAG_LEN;

fn derive_wrap_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>> {
    let mut salt = [0u8; 2 * X25519_KEY_LEN];
    salt[..X25519_KEY_LEN].copy_from_slice(ephemeral_public);
    salt[X25519_KEY_LEN..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(WRAP_INFO, &mut key[..])
        .map_err(|e| E2eError::KeyGenerationFailure(format!("HKDF expansion failed: {e}")))?;
    Ok(key)
}

/// Seal `key` so that only the holder of `recipient`'s private key can open it.
pub fn wrap_channel_key(key: &ChannelKey, recipient: &PublicKeyMaterial) -> Result<WrappedKey> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient.to_dalek());

    // A low-order recipient key has no matching private key to open the blob.
    if !shared.was_contributory() {
        return Err(E2eError::KeyMismatch);
    }

    let wrap_key = derive_wrap_key(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient.as_bytes(),
    )?;
    let cipher = Aes256Gcm::new_from_slice(wrap_key.as_slice())
        .map_err(|_| E2eError::KeyGenerationFailure("Failed to create cipher".to_string()))?;

    let mut nonce_bytes = [0u8; WRAP_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), key.as_bytes().as_slice())
        .map_err(|_| E2eError::KeyGenerationFailure("Key wrap failed".to_string()))?;

    let mut blob = Vec::with_capacity(WRAPPED_KEY_LEN);
    blob.push(WRAP_VERSION);
    blob.extend_from_slice(ephemeral_public.as_bytes());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&sealed);

    Ok(WrappedKey::from_bytes(blob))
}

/// Open a blob produced by [`wrap_channel_key`] with the local private key.
///
/// Fails with [`E2eError::KeyMismatch`] when the blob was sealed for a
/// different public key.
pub fn unwrap_channel_key(wrapped: &WrappedKey, private_key: &PrivateKeyHandle) -> Result<ChannelKey> {
    let bytes = wrapped.as_bytes();
    if bytes.len() != WRAPPED_KEY_LEN {
        return Err(E2eError::InvalidEncoding(format!(
            "wrapped key length: expected {WRAPPED_KEY_LEN}, got {}",
            bytes.len()
        )));
    }
    if bytes[0] != WRAP_VERSION {
        return Err(E2eError::InvalidEncoding(format!(
            "unsupported wrapped key version {}",
            bytes[0]
        )));
    }

    let (ephemeral, rest) = bytes[1..].split_at(X25519_KEY_LEN);
    let (nonce_bytes, sealed) = rest.split_at(WRAP_NONCE_LEN);

    let mut ephemeral_public = [0u8; X25519_KEY_LEN];
    ephemeral_public.copy_from_slice(ephemeral);

    let shared = private_key
        .secret()
        .diffie_hellman(&PublicKey::from(ephemeral_public));
    if !shared.was_contributory() {
        return Err(E2eError::KeyMismatch);
    }

    let recipient_public = private_key.public_key();
    let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral_public, recipient_public.as_bytes())?;
    let cipher = Aes256Gcm::new_from_slice(wrap_key.as_slice())
        .map_err(|_| E2eError::KeyMismatch)?;

    let opened = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| E2eError::KeyMismatch)?,
    );

    let mut key = [0u8; CHANNEL_KEY_LEN];
    if opened.len() != CHANNEL_KEY_LEN {
        return Err(E2eError::KeyMismatch);
    }
    key.copy_from_slice(&opened);
    Ok(ChannelKey::from_bytes(key))
}

/// Turns a wrapped grant into a usable channel key. The session key cache
/// unwraps through this.
#[async_trait]
pub trait KeyUnwrapper: Send + Sync {
    async fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<ChannelKey>;
}

/// Unwraps with the private key held in this device's identity key store.
pub struct LocalUnwrapper {
    identity: IdentityKeyStore,
}

impl LocalUnwrapper {
    pub fn new(identity: IdentityKeyStore) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl KeyUnwrapper for LocalUnwrapper {
    async fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<ChannelKey> {
        let private_key = self
            .identity
            .local_private_key()
            .await
            .ok_or(E2eError::MissingPrivateKey)?;

        let wrapped = wrapped.clone();
        let key = tokio::task::spawn_blocking(move || unwrap_channel_key(&wrapped, &private_key))
            .await
            .map_err(|e| E2eError::Vault(format!("unwrap task failed: {e}")))??;

        debug!(user_id = %self.identity.user_id(), "Unwrapped channel key");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::storage::MemoryVault;
    use std::sync::Arc;

    #[test]
    fn test_wrap_then_unwrap_with_matching_key() {
        let recipient = PrivateKeyHandle::generate();
        let key = ChannelKey::generate();

        let wrapped = wrap_channel_key(&key, &recipient.public_key()).unwrap();
        assert_eq!(wrapped.as_bytes().len(), WRAPPED_KEY_LEN);
        assert_eq!(unwrap_channel_key(&wrapped, &recipient).unwrap(), key);
    }

    #[test]
    fn test_unwrap_with_other_private_key_is_mismatch() {
        let recipient = PrivateKeyHandle::generate();
        let intruder = PrivateKeyHandle::generate();
        let wrapped = wrap_channel_key(&ChannelKey::generate(), &recipient.public_key()).unwrap();

        assert_eq!(
            unwrap_channel_key(&wrapped, &intruder).unwrap_err(),
            E2eError::KeyMismatch
        );
    }

    #[test]
    fn test_wrapped_blob_never_contains_raw_key() {
        let recipient = PrivateKeyHandle::generate();
        let key = ChannelKey::generate();
        let wrapped = wrap_channel_key(&key, &recipient.public_key()).unwrap();

        let raw = key.as_bytes();
        assert!(!wrapped.as_bytes().windows(raw.len()).any(|w| w == raw));
    }

    #[test]
    fn test_wrapping_twice_gives_independent_blobs() {
        let recipient = PrivateKeyHandle::generate();
        let key = ChannelKey::generate();

        let first = wrap_channel_key(&key, &recipient.public_key()).unwrap();
        let second = wrap_channel_key(&key, &recipient.public_key()).unwrap();
        assert_ne!(first, second);
        assert_eq!(unwrap_channel_key(&second, &recipient).unwrap(), key);
    }

    #[test]
    fn test_tampered_blob_is_mismatch() {
        let recipient = PrivateKeyHandle::generate();
        let wrapped = wrap_channel_key(&ChannelKey::generate(), &recipient.public_key()).unwrap();

        let mut bytes = wrapped.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert_eq!(
            unwrap_channel_key(&WrappedKey::from_bytes(bytes), &recipient).unwrap_err(),
            E2eError::KeyMismatch
        );
    }

    #[test]
    fn test_malformed_blob_is_invalid_encoding() {
        let recipient = PrivateKeyHandle::generate();
        let short = WrappedKey::from_bytes(vec![WRAP_VERSION; 10]);
        assert!(matches!(
            unwrap_channel_key(&short, &recipient),
            Err(E2eError::InvalidEncoding(_))
        ));

        let mut bytes = wrap_channel_key(&ChannelKey::generate(), &recipient.public_key())
            .unwrap()
            .as_bytes()
            .to_vec();
        bytes[0] = 9;
        assert!(matches!(
            unwrap_channel_key(&WrappedKey::from_bytes(bytes), &recipient),
            Err(E2eError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_wrap_rejects_low_order_recipient() {
        let zero = PublicKeyMaterial::from_bytes([0u8; 32]);
        assert!(matches!(
            wrap_channel_key(&ChannelKey::generate(), &zero),
            Err(E2eError::KeyMismatch)
        ));
    }

    #[tokio::test]
    async fn test_local_unwrapper_without_private_key() {
        let identity = IdentityKeyStore::new("carol", Arc::new(MemoryVault::new()));
        let unwrapper = LocalUnwrapper::new(identity);
        let wrapped = WrappedKey::from_bytes(vec![0u8; WRAPPED_KEY_LEN]);

        assert_eq!(
            unwrapper.unwrap_key(&wrapped).await.unwrap_err(),
            E2eError::MissingPrivateKey
        );
    }

    #[tokio::test]
    async fn test_local_unwrapper_opens_own_grant() {
        let identity = IdentityKeyStore::new("alice", Arc::new(MemoryVault::new()));
        let public = identity.generate_identity().await.unwrap();
        let key = ChannelKey::generate();
        let wrapped = wrap_channel_key(&key, &public).unwrap();

        let unwrapper = LocalUnwrapper::new(identity);
        assert_eq!(unwrapper.unwrap_key(&wrapped).await.unwrap(), key);
    }
}
