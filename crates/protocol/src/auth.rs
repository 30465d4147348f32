//! Upload token derivation and validation.
//!
//! The master mints the token for a file handle; the storage node, which
//! shares the same secret, recomputes it on `stream_open` and compares in
//! constant time. Tokens are therefore stateless on the storage side: no
//! handshake between master and storage node is needed per upload.

use sha2::{Digest, Sha256};

/// Token length in characters (hex-encoded SHA-256).
pub const TOKEN_LEN: usize = 64;

/// Derives the upload token for `file_id` under `secret`.
pub fn mint_token(secret: &str, file_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(file_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validates a presented token against the expected derivation.
///
/// Uses constant-time comparison to prevent timing attacks.
pub fn validate_token(secret: &str, file_id: &str, presented: &str) -> bool {
    let expected = mint_token(secret, file_id);
    if presented.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in presented.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}
