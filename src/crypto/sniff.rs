//! Heuristic detection of values that are already envelopes.
//!
//! A stored string counts as encrypted when it is hexadecimal (either case)
//! and at least 66 characters long, the size of an envelope carrying one
//! byte of ciphertext. Any other long hex string, such as a token issued by a
//! third party, is misclassified. Callers needing certainty must track the
//! encryption state next to the field.

use super::envelope::HEADER_LEN;

/// Shortest hex string treated as an envelope.
pub const MIN_ENCRYPTED_HEX_LEN: usize = (HEADER_LEN + 1) * 2;

/// Whether `text` looks like an envelope produced by [`super::TokenCipher`].
pub fn looks_encrypted(text: &str) -> bool {
    text.len() >= MIN_ENCRYPTED_HEX_LEN && text.bytes().all(|b| b.is_ascii_hexdigit())
}
