//! Webhook signature verification.
//!
//! GitHub signs the raw body with HMAC-SHA256 and sends
//! `X-Hub-Signature-256: sha256=<hex>`. Terraform Cloud signs with
//! HMAC-SHA512 and sends the bare hex digest in
//! `X-TFE-Notification-Signature`.
//!
//! Both checks compare in constant time through [`Mac::verify_slice`] and
//! never panic on malformed headers.

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Parses a GitHub signature header (`sha256=<hex>`) into raw bytes.
///
/// # Examples
///
/// ```
/// use fwd::webhooks::parse_signature_header;
///
/// assert!(parse_signature_header("sha256=abcd1234").is_some());
/// assert!(parse_signature_header("sha1=abcd1234").is_none());
/// assert!(parse_signature_header("sha256=xyz").is_none());
/// ```
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA256 of a payload.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a GitHub header value, `sha256=<hex>`.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifies a GitHub `X-Hub-Signature-256` header.
///
/// ```
/// use fwd::webhooks::{compute_signature, format_signature_header, verify_signature};
///
/// let header = format_signature_header(&compute_signature(b"{}", b"s3cret"));
/// assert!(verify_signature(b"{}", &header, b"s3cret"));
/// assert!(!verify_signature(b"{}", &header, b"other"));
/// ```
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some(expected) = parse_signature_header(signature_header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Computes the HMAC-SHA512 of a payload, hex-encoded as Terraform Cloud
/// sends it.
pub fn compute_tfc_signature(payload: &[u8], secret: &[u8]) -> String {
    let mut mac = HmacSha512::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a Terraform Cloud `X-TFE-Notification-Signature` header.
pub fn verify_tfc_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Ok(expected) = hex::decode(signature_header.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
