//! AES-256-GCM encryption of single text values.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, Zeroizing};

use super::envelope::{Envelope, NONCE_LEN, TAG_LEN};
use super::key::{derive_key, DerivedKey, KeySource};
use super::sniff::looks_encrypted;
use super::{CryptoError, CryptoResult};
use crate::config::EncryptionConfig;

/// AES-256-GCM with a 128-bit nonce and 128-bit tag.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Encrypts and decrypts credential strings under one derived key.
///
/// The key is derived once at construction. Each call is independent, so a
/// single cipher can be shared across tasks behind an `Arc`.
pub struct TokenCipher {
    aead: Aes256Gcm16,
    source: KeySource,
}

impl TokenCipher {
    /// Build a cipher from an optional operator secret.
    ///
    /// With no secret the development fallback is used and a warning logged.
    pub fn new(secret: Option<&str>) -> CryptoResult<Self> {
        let (secret, source) = KeySource::resolve(secret);
        let key = derive_key(secret)?;
        Self::from_key(&key, source)
    }

    /// Build a cipher from the encryption section of the app config.
    ///
    /// Fails with [`CryptoError::MissingSecret`] instead of falling back when
    /// the deployment requires a configured secret.
    pub fn from_config(config: &EncryptionConfig) -> CryptoResult<Self> {
        let configured = config
            .secret
            .as_deref()
            .filter(|s| !s.is_empty());

        if config.require_secret && configured.is_none() {
            return Err(CryptoError::MissingSecret);
        }

        Self::new(configured)
    }

    /// Build a cipher from an already derived key.
    pub fn from_key(key: &DerivedKey, source: KeySource) -> CryptoResult<Self> {
        let aead = Aes256Gcm16::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(Self { aead, source })
    }

    /// Where this cipher's key came from.
    pub fn key_source(&self) -> KeySource {
        self.source
    }

    /// Encrypt `plaintext` into a fresh hex envelope.
    ///
    /// Every call draws a new random nonce, so encrypting the same value
    /// twice never yields the same envelope.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .aead
            .encrypt_in_place_detached(Nonce::<U16>::from_slice(&nonce), b"", &mut buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut envelope = Envelope {
            nonce,
            tag: [0u8; TAG_LEN],
            ciphertext: buffer,
        };
        envelope.tag.copy_from_slice(tag.as_slice());

        Ok(envelope.to_hex())
    }

    /// Decrypt a hex envelope back to its plaintext.
    ///
    /// Tag verification happens before any bytes are returned; a tampered
    /// envelope or one sealed under another key yields
    /// [`CryptoError::IntegrityFailure`].
    pub fn decrypt(&self, envelope: &str) -> CryptoResult<String> {
        let Envelope {
            nonce,
            tag,
            ciphertext,
        } = Envelope::from_hex(envelope)?;

        let mut buffer = ciphertext;
        if self
            .aead
            .decrypt_in_place_detached(
                Nonce::<U16>::from_slice(&nonce),
                b"",
                &mut buffer,
                Tag::<U16>::from_slice(&tag),
            )
            .is_err()
        {
            buffer.zeroize();
            return Err(CryptoError::IntegrityFailure);
        }

        String::from_utf8(buffer).map_err(|e| {
            e.into_bytes().zeroize();
            CryptoError::EncodingFailure
        })
    }

    /// Encrypt `value` unless it already looks like an envelope.
    ///
    /// Lets update flows resubmit a previously stored envelope unchanged.
    pub fn seal(&self, value: &str) -> CryptoResult<String> {
        if looks_encrypted(value) {
            Ok(value.to_string())
        } else {
            self.encrypt(value)
        }
    }

    /// Decrypt under this key and encrypt again under `target`.
    pub fn reencrypt(&self, envelope: &str, target: &TokenCipher) -> CryptoResult<String> {
        let plaintext = Zeroizing::new(self.decrypt(envelope)?);
        target.encrypt(&plaintext)
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY_A: &str = "2b7e151628aed2a6abf7158809cf4f3c2b7e151628aed2a6abf7158809cf4f3c";
    const KEY_B: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";

    fn cipher(secret: &str) -> TokenCipher {
        TokenCipher::new(Some(secret)).unwrap()
    }

    fn flip_hex_char(text: &str, index: usize) -> String {
        let mut chars: Vec<char> = text.chars().collect();
        chars[index] = if chars[index] == '0' { '1' } else { '0' };
        chars.into_iter().collect()
    }

    #[test]
    fn test_roundtrip() {
        let c = cipher(KEY_A);
        let long = "x".repeat(4096);
        for plaintext in ["abc123token", "", "тест 🔐 トークン", long.as_str()] {
            let envelope = c.encrypt(plaintext).unwrap();
            assert_eq!(c.decrypt(&envelope).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_empty_plaintext_has_full_header() {
        let c = cipher(KEY_A);
        let envelope = c.encrypt("").unwrap();
        assert_eq!(envelope.len(), 64);
        assert_eq!(c.decrypt(&envelope).unwrap(), "");
    }

    #[test]
    fn test_envelope_is_lowercase_hex_of_expected_length() {
        let c = cipher(KEY_A);
        let envelope = c.encrypt("abc123token").unwrap();
        assert_eq!(envelope.len(), (32 + "abc123token".len()) * 2);
        assert!(envelope
            .chars()
            .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch)));
        assert!(looks_encrypted(&envelope));
    }

    #[test]
    fn test_encryption_is_not_deterministic() {
        let c = cipher(KEY_A);
        let first = c.encrypt("same token").unwrap();
        let second = c.encrypt("same token").unwrap();
        assert_ne!(first, second);
        assert_ne!(&first[..32], &second[..32]);
    }

    #[test]
    fn test_tampering_any_tag_or_ciphertext_char_is_detected() {
        let c = cipher(KEY_A);
        let envelope = c.encrypt("abc123token").unwrap();

        for index in 32..envelope.len() {
            let tampered = flip_hex_char(&envelope, index);
            let err = c.decrypt(&tampered).unwrap_err();
            assert!(
                matches!(err, CryptoError::IntegrityFailure),
                "index {} gave {:?}",
                index,
                err
            );
        }
    }

    #[test]
    fn test_tampered_nonce_is_detected() {
        let c = cipher(KEY_A);
        let envelope = c.encrypt("abc123token").unwrap();
        let tampered = flip_hex_char(&envelope, 0);
        assert!(matches!(
            c.decrypt(&tampered),
            Err(CryptoError::IntegrityFailure)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = cipher(KEY_A).encrypt("abc123token").unwrap();
        let err = cipher(KEY_B).decrypt(&envelope).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::IntegrityFailure | CryptoError::EncodingFailure
        ));
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn test_malformed_envelopes_fail_fast() {
        let c = cipher(KEY_A);
        let short = "ab".repeat(31);
        for bad in ["", "not hex at all", "abc", short.as_str()] {
            assert!(matches!(
                c.decrypt(bad),
                Err(CryptoError::MalformedEnvelope(_))
            ));
        }
    }

    #[test]
    fn test_uppercase_envelope_decrypts() {
        let c = cipher(KEY_A);
        let envelope = c.encrypt("abc123token").unwrap().to_uppercase();
        assert_eq!(c.decrypt(&envelope).unwrap(), "abc123token");
    }

    #[test]
    fn test_end_to_end_with_passphrase_secret() {
        let c = cipher("test-secret-key-32-bytes-minimum!");
        let envelope = c.encrypt("abc123token").unwrap();

        assert!(envelope.len() >= 66);
        assert!(looks_encrypted(&envelope));
        assert_eq!(c.decrypt(&envelope).unwrap(), "abc123token");

        let other = cipher("a-completely-different-secret-value");
        assert!(matches!(
            other.decrypt(&envelope),
            Err(CryptoError::IntegrityFailure | CryptoError::EncodingFailure)
        ));
    }

    #[test]
    fn test_seal_passes_envelopes_through() {
        let c = cipher(KEY_A);
        let envelope = c.encrypt("abc123token").unwrap();
        assert_eq!(c.seal(&envelope).unwrap(), envelope);

        let sealed = c.seal("fresh-token").unwrap();
        assert_ne!(sealed, "fresh-token");
        assert_eq!(c.decrypt(&sealed).unwrap(), "fresh-token");
    }

    #[test]
    fn test_reencrypt_moves_value_to_new_key() {
        let old = cipher(KEY_A);
        let new = cipher(KEY_B);
        let envelope = old.encrypt("abc123token").unwrap();

        let rotated = old.reencrypt(&envelope, &new).unwrap();
        assert_eq!(new.decrypt(&rotated).unwrap(), "abc123token");
        assert!(old.decrypt(&rotated).is_err());
    }

    #[test]
    fn test_fallback_cipher_is_usable() {
        let c = TokenCipher::new(None).unwrap();
        assert_eq!(c.key_source(), KeySource::DevelopmentFallback);
        let envelope = c.encrypt("dev-token").unwrap();
        assert_eq!(c.decrypt(&envelope).unwrap(), "dev-token");
    }

    #[test]
    fn test_from_config_requires_secret_when_asked() {
        let config = EncryptionConfig {
            secret: None,
            require_secret: true,
        };
        assert!(matches!(
            TokenCipher::from_config(&config),
            Err(CryptoError::MissingSecret)
        ));

        let config = EncryptionConfig {
            secret: Some(KEY_A.to_string()),
            require_secret: true,
        };
        let c = TokenCipher::from_config(&config).unwrap();
        assert_eq!(c.key_source(), KeySource::Configured);
    }

    #[test]
    fn test_from_config_empty_secret_is_missing_but_whitespace_is_not() {
        let config = EncryptionConfig {
            secret: Some(String::new()),
            require_secret: true,
        };
        assert!(matches!(
            TokenCipher::from_config(&config),
            Err(CryptoError::MissingSecret)
        ));

        let config = EncryptionConfig {
            secret: Some("  ".to_string()),
            require_secret: true,
        };
        let c = TokenCipher::from_config(&config).unwrap();
        assert_eq!(c.key_source(), KeySource::Configured);
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let rendered = format!("{:?}", cipher(KEY_A));
        assert!(!rendered.contains("2b7e"));
        assert!(rendered.contains("Configured"));
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_string(plaintext in any::<String>()) {
            let c = cipher(KEY_A);
            let envelope = c.encrypt(&plaintext).unwrap();
            prop_assert_eq!(c.decrypt(&envelope).unwrap(), plaintext);
        }

        #[test]
        fn prop_nonempty_envelopes_look_encrypted(plaintext in ".{1,64}") {
            let envelope = cipher(KEY_A).encrypt(&plaintext).unwrap();
            prop_assert!(looks_encrypted(&envelope));
        }
    }
}
