//! Payload signing for outbound webhooks.
//!
//! Signatures are HMAC-SHA256 over the exact request body, sent as
//! `sha256=<hex>` in the `X-Syncbridge-Signature` header. Receivers verify
//! with [`verify_signature`] using the webhook's secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature
pub const SIGNATURE_HEADER: &str = "X-Syncbridge-Signature";
/// Header carrying the event kind
pub const EVENT_HEADER: &str = "X-Syncbridge-Event";
/// Header carrying the delivery id
pub const DELIVERY_HEADER: &str = "X-Syncbridge-Delivery";

/// Compute the signature header value for a payload.
pub fn compute_signature(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take any key size");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a `sha256=<hex>` signature in constant time.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(hex_part) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
