//! Message cipher: AES-256-GCM under a channel key, fresh random nonce per call.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use super::types::ChannelKey;
use crate::error::{E2eError, Result};

/// Nonce size for AES-256-GCM.
pub const NONCE_SIZE: usize = 12;

/// Ciphertext (with 16-byte tag) and the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

/// Base64 form of an [`EncryptedPayload`], as stored in a message row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub content: String,
    pub iv: String,
}

/// Encrypts and decrypts message content for one channel.
///
/// Synchronous: the facade calls it inline on the async task. Inputs are
/// bounded by the outgoing message limits (10 000 characters of text, ten
/// file references), so no call holds the executor for long. Unwrap and key
/// generation, the slow asymmetric steps, run on the blocking pool.
pub struct MessageCipher {
    cipher: Aes256Gcm,
}

impl MessageCipher {
    pub fn new(key: &ChannelKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    /// Encrypt with a nonce drawn from the OS CSPRNG.
    ///
    /// Nonces are never derived from message ids, counters or timestamps.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| E2eError::InvalidInput("plaintext too large to encrypt".to_string()))?;

        Ok(EncryptedPayload { ciphertext, nonce })
    }

    /// Decrypt; any wrong key, tampering, truncation or missing nonce is
    /// [`E2eError::DecryptionFailed`].
    pub fn decrypt(&self, ciphertext: &[u8], nonce: Option<&[u8]>) -> Result<Vec<u8>> {
        let nonce = nonce.ok_or(E2eError::DecryptionFailed)?;
        if nonce.len() != NONCE_SIZE {
            return Err(E2eError::DecryptionFailed);
        }

        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| E2eError::DecryptionFailed)
    }

    /// Encrypt UTF-8 text and base64 both halves for storage.
    pub fn encrypt_text(&self, text: &str) -> Result<EncodedPayload> {
        let sealed = self.encrypt(text.as_bytes())?;
        Ok(EncodedPayload {
            content: STANDARD.encode(&sealed.ciphertext),
            iv: STANDARD.encode(sealed.nonce),
        })
    }

    /// Inverse of [`MessageCipher::encrypt_text`].
    pub fn decrypt_text(&self, content: &str, iv: Option<&str>) -> Result<String> {
        let ciphertext = STANDARD
            .decode(content.as_bytes())
            .map_err(|_| E2eError::DecryptionFailed)?;
        let nonce = iv
            .map(|iv| STANDARD.decode(iv.as_bytes()))
            .transpose()
            .map_err(|_| E2eError::DecryptionFailed)?;

        let plaintext = self.decrypt(&ciphertext, nonce.as_deref())?;
        String::from_utf8(plaintext).map_err(|_| E2eError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = MessageCipher::new(&ChannelKey::generate());
        let sealed = cipher.encrypt(b"hello team").unwrap();

        let opened = cipher.decrypt(&sealed.ciphertext, Some(&sealed.nonce)).unwrap();
        assert_eq!(opened, b"hello team");
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let cipher = MessageCipher::new(&ChannelKey::generate());
        let sealed = cipher.encrypt(b"").unwrap();
        assert_eq!(cipher.decrypt(&sealed.ciphertext, Some(&sealed.nonce)).unwrap(), b"");
    }

    #[test]
    fn test_same_plaintext_gets_fresh_nonce_and_ciphertext() {
        let cipher = MessageCipher::new(&ChannelKey::generate());
        let first = cipher.encrypt(b"same words").unwrap();
        let second = cipher.encrypt(b"same words").unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = MessageCipher::new(&ChannelKey::generate()).encrypt(b"secret").unwrap();
        let other = MessageCipher::new(&ChannelKey::generate());

        assert_eq!(
            other.decrypt(&sealed.ciphertext, Some(&sealed.nonce)).unwrap_err(),
            E2eError::DecryptionFailed
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = MessageCipher::new(&ChannelKey::generate());
        let sealed = cipher.encrypt(b"wire me 100").unwrap();

        let mut tampered = sealed.ciphertext.clone();
        tampered[0] ^= 0x80;
        assert_eq!(
            cipher.decrypt(&tampered, Some(&sealed.nonce)).unwrap_err(),
            E2eError::DecryptionFailed
        );
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let cipher = MessageCipher::new(&ChannelKey::generate());
        let sealed = cipher.encrypt(b"wire me 100").unwrap();

        let mut nonce = sealed.nonce;
        nonce[NONCE_SIZE - 1] ^= 0x01;
        assert_eq!(
            cipher.decrypt(&sealed.ciphertext, Some(&nonce)).unwrap_err(),
            E2eError::DecryptionFailed
        );
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let cipher = MessageCipher::new(&ChannelKey::generate());
        let sealed = cipher.encrypt(b"a longer message body").unwrap();

        let truncated = &sealed.ciphertext[..sealed.ciphertext.len() - 4];
        assert_eq!(
            cipher.decrypt(truncated, Some(&sealed.nonce)).unwrap_err(),
            E2eError::DecryptionFailed
        );
        assert!(cipher.decrypt(&[], Some(&sealed.nonce)).is_err());
    }

    #[test]
    fn test_missing_or_short_nonce_fails() {
        let cipher = MessageCipher::new(&ChannelKey::generate());
        let sealed = cipher.encrypt(b"hello").unwrap();

        assert_eq!(
            cipher.decrypt(&sealed.ciphertext, None).unwrap_err(),
            E2eError::DecryptionFailed
        );
        assert_eq!(
            cipher.decrypt(&sealed.ciphertext, Some(&sealed.nonce[..8])).unwrap_err(),
            E2eError::DecryptionFailed
        );
    }

    #[test]
    fn test_text_roundtrip_through_base64() {
        let cipher = MessageCipher::new(&ChannelKey::generate());
        let encoded = cipher.encrypt_text("héllo 👋").unwrap();

        assert_ne!(encoded.content, "héllo 👋");
        assert_eq!(
            cipher.decrypt_text(&encoded.content, Some(&encoded.iv)).unwrap(),
            "héllo 👋"
        );
    }

    #[test]
    fn test_text_with_garbage_encoding_fails() {
        let cipher = MessageCipher::new(&ChannelKey::generate());
        let encoded = cipher.encrypt_text("hello").unwrap();

        assert_eq!(
            cipher.decrypt_text("%%%", Some(&encoded.iv)).unwrap_err(),
            E2eError::DecryptionFailed
        );
        assert_eq!(
            cipher.decrypt_text(&encoded.content, Some("%%%")).unwrap_err(),
            E2eError::DecryptionFailed
        );
        assert_eq!(
            cipher.decrypt_text(&encoded.content, None).unwrap_err(),
            E2eError::DecryptionFailed
        );
    }
}
