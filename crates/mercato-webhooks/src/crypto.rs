//! Signature verification and payload hashing.
//!
//! One documented signature scheme: HMAC-SHA256 over the raw request
//! body, base64-encoded, compared in constant time. Payload hashes for
//! dedup are SHA-256 over canonicalized JSON (recursively sorted keys),
//! hex-encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Compute the base64-encoded HMAC-SHA256 signature of a raw body.
#[must_use]
pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verify a delivery signature using constant-time comparison.
#[must_use]
pub fn verify_signature(expected: &str, secret: &str, body: &[u8]) -> bool {
    let computed = compute_signature(secret, body);
    constant_time_eq(expected.as_bytes(), computed.as_bytes())
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

/// SHA-256 hex hash of a payload's canonical JSON form.
///
/// Key order does not affect the hash, so retried deliveries that
/// re-serialize the same payload dedup correctly.
#[must_use]
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let canonical = canonicalize_json(payload);
    let serialized = canonical.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recursively sort JSON object keys for a canonical representation.
fn canonicalize_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize_json(v)))
                .collect();
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(canonicalize_json).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signature_deterministic() {
        let sig1 = compute_signature("secret", b"payload");
        let sig2 = compute_signature("secret", b"payload");
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn test_signature_changes_with_secret() {
        assert_ne!(
            compute_signature("secret1", b"payload"),
            compute_signature("secret2", b"payload")
        );
    }

    #[test]
    fn test_signature_changes_with_body() {
        assert_ne!(
            compute_signature("secret", b"payload1"),
            compute_signature("secret", b"payload2")
        );
    }

    #[test]
    fn test_signature_is_base64_of_32_bytes() {
        let sig = compute_signature("secret", b"payload");
        let decoded = BASE64.decode(&sig).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn test_verify_valid_signature() {
        let sig = compute_signature("my-secret", b"body");
        assert!(verify_signature(&sig, "my-secret", b"body"));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let sig = compute_signature("my-secret", b"body");
        assert!(!verify_signature(&sig, "other-secret", b"body"));
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let sig = compute_signature("my-secret", b"body");
        assert!(!verify_signature(&sig, "my-secret", b"tampered"));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert!(!verify_signature("not-base64!!!", "secret", b"body"));
    }

    #[test]
    fn test_payload_hash_key_order_independent() {
        let a = json!({"a": 1, "b": {"x": 1, "y": 2}});
        let b = json!({"b": {"y": 2, "x": 1}, "a": 1});
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn test_payload_hash_differs_for_different_payloads() {
        assert_ne!(
            payload_hash(&json!({"id": 1})),
            payload_hash(&json!({"id": 2}))
        );
    }

    #[test]
    fn test_payload_hash_is_hex_sha256() {
        let hash = payload_hash(&json!({"id": 1}));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
