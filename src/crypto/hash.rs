//! Deterministic hashing of write requests
//!
//! Request fingerprints use RFC 8785 JSON Canonicalization (JCS) via
//! `serde_json_canonicalizer`, so two payloads that differ only in key
//! order or number formatting hash identically:
//! - Deterministic key ordering (lexicographic UTF-8)
//! - ES6-compatible number serialization
//! - Domain separation prefixes per hash purpose

use sha2::{Digest, Sha256};

use crate::domain::{Hash256, TenantId};
use crate::infra::{Result, SyncError};

/// Domain prefix for write request fingerprints
pub const DOMAIN_REQUEST: &[u8] = b"LEDGER_SYNC_REQUEST_V1";

/// Domain prefix for derived idempotency keys
pub const DOMAIN_IDEMPOTENCY_KEY: &[u8] = b"LEDGER_SYNC_IDEMPOTENCY_KEY_V1";

/// Prefix marking idempotency keys the core derived itself
pub const DERIVED_KEY_PREFIX: &str = "derived:";

/// Convert a JSON value to its RFC 8785 canonical string
pub fn canonicalize_json(value: &serde_json::Value) -> Result<String> {
    serde_json_canonicalizer::to_string(value)
        .map_err(|e| SyncError::Serialization(format!("cannot canonicalize payload: {}", e)))
}

/// Hash raw bytes with SHA-256 (no domain prefix)
pub fn sha256(data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Fingerprint of a write payload, stored with every outbound log entry.
///
/// A replay with the same idempotency key is only valid if this matches.
pub fn request_hash(payload: &serde_json::Value) -> Result<Hash256> {
    let canonical = canonicalize_json(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_REQUEST);
    hasher.update(canonical.as_bytes());
    Ok(hasher.finalize().into())
}

/// Derive a stable idempotency key from the write itself.
///
/// Used when the caller supplies none: the same tenant, operation and
/// canonical payload always yield the same key.
pub fn derive_idempotency_key(
    tenant_id: &TenantId,
    operation: &str,
    payload: &serde_json::Value,
) -> Result<String> {
    let material = serde_json::json!({
        "operation": operation,
        "payload": payload,
        "tenant_id": tenant_id.0.to_string(),
    });
    let canonical = canonicalize_json(&material)?;

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_IDEMPOTENCY_KEY);
    hasher.update(canonical.as_bytes());
    let digest: Hash256 = hasher.finalize().into();
    Ok(format!("{}{}", DERIVED_KEY_PREFIX, hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_hash_ignores_key_order() {
        let a = json!({"amount": 100, "vendor": "Acme", "memo": {"b": 1, "a": 2}});
        let b = json!({"memo": {"a": 2, "b": 1}, "vendor": "Acme", "amount": 100});
        assert_eq!(request_hash(&a).unwrap(), request_hash(&b).unwrap());
    }

    #[test]
    fn test_request_hash_detects_value_change() {
        let a = json!({"amount": 100});
        let b = json!({"amount": 101});
        assert_ne!(request_hash(&a).unwrap(), request_hash(&b).unwrap());
    }

    #[test]
    fn test_derived_key_is_stable_and_scoped() {
        let tenant = TenantId::new();
        let payload = json!({"bill_id": "b-1", "amount": 50});

        let k1 = derive_idempotency_key(&tenant, "create_payment", &payload).unwrap();
        let k2 = derive_idempotency_key(&tenant, "create_payment", &payload).unwrap();
        assert_eq!(k1, k2);
        assert!(k1.starts_with(DERIVED_KEY_PREFIX));
        assert_eq!(k1.len(), DERIVED_KEY_PREFIX.len() + 64);

        let other_op = derive_idempotency_key(&tenant, "update_bill", &payload).unwrap();
        let other_tenant = derive_idempotency_key(&TenantId::new(), "create_payment", &payload).unwrap();
        assert_ne!(k1, other_op);
        assert_ne!(k1, other_tenant);
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
