//! Webhook signature primitive.
//!
//! Devices sign the canonical JSON body with HMAC-SHA256 and send the hex
//! digest in `X-Device-Signature`. Verification is constant-time; a missing
//! secret or signature always fails closed.

use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Canonical bytes for signing: the compact JSON serialization.
pub fn canonical_body(body: &serde_json::Value) -> Vec<u8> {
    // serde_json's compact form is stable for a given value tree.
    serde_json::to_vec(body).unwrap_or_default()
}

/// HMAC-SHA256 over `body`, hex-encoded.
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA-256 accepts keys of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a hex signature against `body`.
pub fn verify(body: &[u8], signature_hex: &str, secret: &str) -> bool {
    if signature_hex.is_empty() || secret.is_empty() {
        return false;
    }
    let Ok(provided) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA-256 accepts keys of any size");
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    constant_time_eq(&expected, &provided)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_verifies() {
        let body = canonical_body(&json!({
            "eventType": "file_created",
            "filePath": "/exports/img1.dcm",
            "patientId": "P42",
        }));
        let signature = sign(&body, "abc");
        assert!(verify(&body, &signature, "abc"));
    }

    #[test]
    fn tampered_body_fails() {
        let body = canonical_body(&json!({"eventType": "file_created"}));
        let signature = sign(&body, "abc");
        let tampered = canonical_body(&json!({"eventType": "file_modified"}));
        assert!(!verify(&tampered, &signature, "abc"));
    }

    #[test]
    fn wrong_secret_or_garbage_signature_fails() {
        let body = b"{}";
        let signature = sign(body, "abc");
        assert!(!verify(body, &signature, "xyz"));
        assert!(!verify(body, "deadbeef", "abc"));
        assert!(!verify(body, "not-hex!", "abc"));
        assert!(!verify(body, "", "abc"));
        assert!(!verify(body, &signature, ""));
    }
}
