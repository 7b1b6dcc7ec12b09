//! Per-field content hashes.
//!
//! A field's digest is SHA3-256 over its serialized parts, in order: every
//! element of an array contributes its canonical JSON text, any other value
//! contributes its own JSON text. JSON quoting keeps `["ab", "c"]` and
//! `["a", "bc"]` apart.

use serde_json::Value;
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;

use crate::envelope::Payload;

/// Hex digest of one field value
pub fn hash_value(value: &Value) -> String {
    let mut hasher = Sha3_256::new();
    match value {
        Value::Array(items) => {
            for item in items {
                hasher.update(item.to_string().as_bytes());
            }
        }
        other => hasher.update(other.to_string().as_bytes()),
    }
    hex::encode(hasher.finalize())
}

/// Digest every named field the payload has. Unknown fields are skipped,
/// so they will fail verification later.
pub fn hash_fields<P: Payload>(payload: &P, fields: &[&str]) -> BTreeMap<String, String> {
    fields
        .iter()
        .filter_map(|field| {
            payload
                .field_value(field)
                .map(|value| (field.to_string(), hash_value(&value)))
        })
        .collect()
}

/// Recompute the named fields and compare against `received`. Any missing
/// field or hash, or any mismatch, yields `false`.
pub fn verify<P: Payload>(payload: &P, fields: &[&str], received: &BTreeMap<String, String>) -> bool {
    fields.iter().all(|field| {
        match (payload.field_value(field), received.get(*field)) {
            (Some(value), Some(expected)) => hash_value(&value) == *expected,
            _ => false,
        }
    })
}

/// Digest over the field digests in declared order; this is what gets signed.
pub fn body_hash(hashes: &BTreeMap<String, String>, fields: &[&str]) -> String {
    let mut hasher = Sha3_256::new();
    for field in fields {
        if let Some(digest) = hashes.get(*field) {
            hasher.update(digest.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Prompting, StrictPrompting};
    use serde_json::json;

    fn prompt() -> Prompting {
        Prompting::new(
            vec!["system".into(), "user".into()],
            vec!["You are terse.".into(), "What is 6 x 7?".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_stamp_then_verify() {
        let p = prompt();
        let hashes = hash_fields(&p, p.required_hash_fields());
        assert_eq!(hashes.len(), 1);
        assert!(hashes.contains_key("messages"));
        assert!(verify(&p, p.required_hash_fields(), &hashes));
    }

    #[test]
    fn test_tampered_field_fails() {
        let p = prompt();
        let hashes = hash_fields(&p, p.required_hash_fields());

        let tampered = Prompting::new(
            vec!["system".into(), "user".into()],
            vec!["You are terse.".into(), "What is 6 x 9?".into()],
        )
        .unwrap();
        assert!(!verify(&tampered, tampered.required_hash_fields(), &hashes));
    }

    #[test]
    fn test_missing_hash_fails() {
        let p = prompt();
        assert!(!verify(&p, p.required_hash_fields(), &BTreeMap::new()));

        let mut hashes = hash_fields(&p, p.required_hash_fields());
        hashes.insert("messages".into(), "00".repeat(32));
        assert!(!verify(&p, p.required_hash_fields(), &hashes));
    }

    #[test]
    fn test_unknown_field_never_verifies() {
        let p = prompt();
        let hashes = hash_fields(&p, &["no_such_field"]);
        assert!(hashes.is_empty());
        assert!(!verify(&p, &["no_such_field"], &hashes));
    }

    #[test]
    fn test_advisory_roles_not_hashed() {
        // Prompting treats roles as advisory, the strict variant does not
        let p = prompt();
        assert!(!p.required_hash_fields().contains(&"roles"));

        let strict = StrictPrompting::new(vec!["user".into()], vec!["hi".into()]).unwrap();
        let hashes = hash_fields(&strict, strict.required_hash_fields());
        assert!(hashes.contains_key("roles"));
        assert!(hashes.contains_key("messages"));
    }

    #[test]
    fn test_order_sensitive() {
        let a = hash_value(&json!(["ab", "c"]));
        let b = hash_value(&json!(["a", "bc"]));
        let c = hash_value(&json!(["c", "ab"]));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, hash_value(&json!(["ab", "c"])));
    }

    #[test]
    fn test_body_hash_follows_field_order() {
        let mut hashes = BTreeMap::new();
        hashes.insert("roles".to_string(), "aa".to_string());
        hashes.insert("messages".to_string(), "bb".to_string());
        assert_ne!(
            body_hash(&hashes, &["roles", "messages"]),
            body_hash(&hashes, &["messages", "roles"])
        );
    }
}
