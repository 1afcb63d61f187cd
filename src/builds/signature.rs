//! `X-Hub-Signature-256` verification for inbound webhooks.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the expected header value for `body`: `sha256=<lowercase hex>`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Verify a webhook body against the header-supplied signature.
///
/// The comparison runs in constant time over the full header string. An empty
/// secret rejects everything so a missing configuration never accepts unsigned
/// traffic.
pub fn verify(secret: &[u8], body: &[u8], signature_header: Option<&str>) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(provided) = signature_header else {
        return false;
    };
    let expected = sign(secret, body);
    expected.as_bytes().ct_eq(provided.trim().as_bytes()).into()
}
