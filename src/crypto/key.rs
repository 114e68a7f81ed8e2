//! Key derivation from the operator-supplied secret.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use scrypt::{scrypt, Params};
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CryptoError, CryptoResult};

/// Length of the derived AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Salt shared by every installation for passphrase stretching.
const PASSPHRASE_SALT: &[u8] = b"salt";

/// scrypt cost parameters: N = 2^14, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Passphrase used when no secret is configured. Development only.
pub const DEV_FALLBACK_SECRET: &str = "botdeck-dev-secret-change-me";

const HEX_KEY_LEN: usize = 64;
const BASE64_KEY_LEN: usize = 44;

/// A 256-bit symmetric key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Where the key material for a cipher came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// An operator-configured secret.
    Configured,
    /// The built-in development passphrase.
    DevelopmentFallback,
}

impl KeySource {
    /// Pick the secret to derive from, falling back to the development
    /// passphrase when no secret (or an empty one) is configured. Any other
    /// string, whitespace included, is a passphrase.
    pub fn resolve(secret: Option<&str>) -> (&str, KeySource) {
        match secret {
            Some(s) if !s.is_empty() => (s, KeySource::Configured),
            _ => {
                warn!(
                    "No encryption secret configured; using the insecure development fallback. \
                     Set BOTDECK_ENCRYPTION__SECRET before storing real bot tokens."
                );
                (DEV_FALLBACK_SECRET, KeySource::DevelopmentFallback)
            }
        }
    }
}

/// Turn an operator secret into a 32-byte key.
///
/// Raw hex and raw base64 keys are decoded as-is. Everything else, including
/// strings that only look like hex/base64 but fail to decode to 32 bytes, is
/// stretched with scrypt.
pub fn derive_key(secret: &str) -> CryptoResult<DerivedKey> {
    if let Some(key) = decode_raw_hex(secret).or_else(|| decode_raw_base64(secret)) {
        return Ok(key);
    }
    stretch_passphrase(secret)
}

/// Generate a random key in the 64-hex-character form operators can configure.
pub fn generate_hex_key() -> String {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    let encoded = hex::encode(bytes);
    bytes.zeroize();
    encoded
}

fn decode_raw_hex(secret: &str) -> Option<DerivedKey> {
    if secret.len() != HEX_KEY_LEN || !secret.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut bytes = hex::decode(secret).ok()?;
    let key = to_key(&bytes);
    bytes.zeroize();
    key
}

fn decode_raw_base64(secret: &str) -> Option<DerivedKey> {
    if secret.len() != BASE64_KEY_LEN || !secret.ends_with('=') {
        return None;
    }
    let mut bytes = BASE64.decode(secret).ok()?;
    let key = to_key(&bytes);
    bytes.zeroize();
    key
}

fn to_key(bytes: &[u8]) -> Option<DerivedKey> {
    let arr: [u8; KEY_LEN] = bytes.try_into().ok()?;
    Some(DerivedKey(arr))
}

fn stretch_passphrase(passphrase: &str) -> CryptoResult<DerivedKey> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut key = [0u8; KEY_LEN];
    scrypt(passphrase.as_bytes(), PASSPHRASE_SALT, &params, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let derived = DerivedKey(key);
    key.zeroize();
    Ok(derived)
}
