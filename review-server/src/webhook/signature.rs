use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Optional prefix some senders put in front of the hex digest.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify an HMAC-SHA256 hex signature over the raw body in constant time.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let signature_hex = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature);
    if signature_hex.is_empty() {
        return false;
    }

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Hex HMAC-SHA256 of `payload`, as Gitea sends it.
#[cfg(test)]
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}
