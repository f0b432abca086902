//! Handshake authentication with a pre-shared key.
//!
//! The accepting side puts a random nonce in its welcome; the connecting
//! side answers with `HMAC-SHA256(secret, nonce + address)` in its first
//! announcement.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generate a fresh handshake nonce.
pub fn new_nonce() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sign `nonce + address` with the shared secret, hex-encoded.
pub fn sign(secret: &str, nonce: &str, address: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(nonce.as_bytes());
    mac.update(address.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signature using constant-time comparison.
pub fn verify(secret: &str, nonce: &str, address: &str, signature: &str) -> bool {
    let expected = sign(secret, nonce, address);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}
