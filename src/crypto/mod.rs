//! Encryption of bot credentials at rest.
//!
//! Bot tokens (and template API keys) are stored as hex envelopes produced by
//! AES-256-GCM under a key derived from the operator's configured secret.
//!
//! ## Envelope Format
//!
//! ```text
//! hex( nonce[16] || tag[16] || ciphertext[n] )
//! ```
//!
//! ## Key Sources
//!
//! - 64 hex characters: used as the raw 32-byte key
//! - 44 base64 characters ending in `=` that decode to exactly 32 bytes:
//!   used as the raw key (a `==` suffix only ever decodes to 31 bytes)
//! - anything else: stretched with scrypt under a fixed salt
//! - nothing configured: development passphrase, with a warning
//!
//! ## Usage
//!
//! ```ignore
//! let cipher = TokenCipher::new(Some("my-operator-secret"))?;
//!
//! let stored = cipher.encrypt("discord-bot-token")?;
//! assert!(looks_encrypted(&stored));
//!
//! let token = cipher.decrypt(&stored)?;
//! ```

pub mod cipher;
pub mod envelope;
pub mod key;
pub mod sniff;

pub use cipher::TokenCipher;
pub use envelope::Envelope;
pub use key::{derive_key, generate_hex_key, DerivedKey, KeySource};
pub use sniff::looks_encrypted;

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Integrity check failed - tampered data or wrong key")]
    IntegrityFailure,

    #[error("Decrypted payload is not valid UTF-8 - wrong key")]
    EncodingFailure,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption secret not configured")]
    MissingSecret,
}

impl CryptoError {
    /// Whether the stored value is unrecoverable under the current key.
    ///
    /// Malformed, tampered and wrongly-keyed envelopes are all reported the
    /// same way to operators.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedEnvelope(_) | Self::IntegrityFailure | Self::EncodingFailure
        )
    }
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
