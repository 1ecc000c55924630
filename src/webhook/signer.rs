//! HMAC-SHA256 payload signing.
//!
//! Signatures are lowercase hex over the raw payload bytes. Verification is
//! constant-time through the MAC API; hex strings are never compared with
//! `==`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str) -> HmacSha256 {
    // HMAC-SHA256 accepts keys of any length.
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length")
}

/// Hex HMAC-SHA256 signature of `payload` under `secret`.
pub fn sign(payload: &str, secret: &str) -> String {
    let mut m = mac(secret);
    m.update(payload.as_bytes());
    hex::encode(m.finalize().into_bytes())
}

/// Constant-time signature check. Malformed hex is simply invalid.
pub fn verify(payload: &str, signature_hex: &str, secret: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut m = mac(secret);
    m.update(payload.as_bytes());
    m.verify_slice(&signature).is_ok()
}
