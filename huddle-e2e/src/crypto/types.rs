use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{E2eError, Result};

/// Length in bytes of an AES-256 channel key.
pub const CHANNEL_KEY_LEN: usize = 32;

/// Length in bytes of an X25519 key.
pub const X25519_KEY_LEN: usize = 32;

/// Symmetric AES-256 key shared by every member of an encrypted channel.
///
/// Has no `Serialize` impl: the only way a channel key leaves
/// the process is wrapped under a member's public key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey([u8; CHANNEL_KEY_LEN]);

impl ChannelKey {
    /// Draw a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; CHANNEL_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub(crate) fn from_bytes(bytes: [u8; CHANNEL_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; CHANNEL_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for ChannelKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for ChannelKey {}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelKey([REDACTED])")
    }
}

/// X25519 public key as published in the identity directory.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKeyMaterial([u8; X25519_KEY_LEN]);

/// OKP JSON Web Key for an X25519 public key (RFC 8037).
#[derive(Debug, Deserialize)]
struct PublicKeyJwk {
    kty: String,
    crv: String,
    x: String,
}

impl PublicKeyMaterial {
    pub fn from_bytes(bytes: [u8; X25519_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; X25519_KEY_LEN] {
        &self.0
    }

    pub(crate) fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }

    /// Serialize as a JWK string, the portable form stored in the directory.
    pub fn to_jwk(&self) -> String {
        serde_json::json!({
            "kty": "OKP",
            "crv": "X25519",
            "x": URL_SAFE_NO_PAD.encode(self.0),
        })
        .to_string()
    }

    /// Parse a JWK string produced by [`PublicKeyMaterial::to_jwk`].
    pub fn from_jwk(jwk: &str) -> Result<Self> {
        let parsed: PublicKeyJwk = serde_json::from_str(jwk)
            .map_err(|e| E2eError::InvalidEncoding(format!("public key JWK: {e}")))?;

        if parsed.kty != "OKP" || parsed.crv != "X25519" {
            return Err(E2eError::InvalidEncoding(format!(
                "unsupported key type {}/{}",
                parsed.kty, parsed.crv
            )));
        }

        let raw = URL_SAFE_NO_PAD
            .decode(parsed.x.as_bytes())
            .map_err(|e| E2eError::InvalidEncoding(format!("public key x: {e}")))?;
        let bytes: [u8; X25519_KEY_LEN] = raw.try_into().map_err(|raw: Vec<u8>| {
            E2eError::InvalidEncoding(format!(
                "public key length: expected {X25519_KEY_LEN}, got {}",
                raw.len()
            ))
        })?;

        Ok(Self(bytes))
    }

    /// Colon-separated SHA-256 fingerprint, for logs and key verification.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        Sha256::digest(self.0)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Debug for PublicKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKeyMaterial")
            .field(&hex::encode(self.0))
            .finish()
    }
}

/// Opaque handle to this device's X25519 private key.
///
/// There is no `Serialize` impl and no public accessor for the secret bytes.
/// Only the crate's device-local vaults can export it.
#[derive(Clone)]
pub struct PrivateKeyHandle {
    secret: StaticSecret,
}

impl PrivateKeyHandle {
    pub(crate) fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub(crate) fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != X25519_KEY_LEN {
            return Err(E2eError::InvalidEncoding(format!(
                "private key length: expected {X25519_KEY_LEN}, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; X25519_KEY_LEN];
        arr.copy_from_slice(bytes);
        let secret = StaticSecret::from(arr);
        arr.zeroize();
        Ok(Self { secret })
    }

    pub(crate) fn secret_bytes(&self) -> Zeroizing<[u8; X25519_KEY_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// The public half matching this private key.
    pub fn public_key(&self) -> PublicKeyMaterial {
        PublicKeyMaterial(*PublicKey::from(&self.secret).as_bytes())
    }
}

impl fmt::Debug for PrivateKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyHandle")
            .field("public", &hex::encode(self.public_key().as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// A channel key sealed for one recipient. Opaque outside the wrap engine.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey(Vec<u8>);

impl WrappedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Base64 (standard alphabet) form stored by the grant store.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        STANDARD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(|e| E2eError::InvalidEncoding(format!("wrapped key: {e}")))
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedKey({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwk_roundtrip_preserves_key() {
        let handle = PrivateKeyHandle::generate();
        let public = handle.public_key();

        let jwk = public.to_jwk();
        assert!(jwk.contains("\"kty\":\"OKP\""));
        assert!(jwk.contains("\"crv\":\"X25519\""));
        assert_eq!(PublicKeyMaterial::from_jwk(&jwk).unwrap(), public);
    }

    #[test]
    fn test_jwk_rejects_rsa_keys() {
        let jwk = r#"{"kty":"RSA","crv":"X25519","x":"AAAA"}"#;
        assert!(matches!(
            PublicKeyMaterial::from_jwk(jwk),
            Err(E2eError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_jwk_rejects_short_key() {
        let jwk = format!(
            r#"{{"kty":"OKP","crv":"X25519","x":"{}"}}"#,
            URL_SAFE_NO_PAD.encode([7u8; 16])
        );
        assert!(PublicKeyMaterial::from_jwk(&jwk).is_err());
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let handle = PrivateKeyHandle::generate();
        let debug = format!("{handle:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(&hex::encode(handle.secret_bytes().as_slice())));
    }

    #[test]
    fn test_private_key_restores_from_secret_bytes() {
        let handle = PrivateKeyHandle::generate();
        let restored = PrivateKeyHandle::from_secret_bytes(handle.secret_bytes().as_slice()).unwrap();
        assert_eq!(restored.public_key(), handle.public_key());
        assert!(PrivateKeyHandle::from_secret_bytes(&[1u8; 16]).is_err());
    }

    #[test]
    fn test_channel_keys_are_random_and_redacted() {
        let a = ChannelKey::generate();
        let b = ChannelKey::generate();
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
        assert_eq!(format!("{a:?}"), "ChannelKey([REDACTED])");
    }

    #[test]
    fn test_wrapped_key_base64() {
        let wrapped = WrappedKey::from_bytes(vec![1, 2, 3, 250]);
        let encoded = wrapped.to_base64();
        assert_eq!(WrappedKey::from_base64(&encoded).unwrap(), wrapped);
        assert!(WrappedKey::from_base64("not base64!").is_err());
    }
}
