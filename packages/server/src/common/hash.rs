//! Content hashing for deduplication and artifact integrity.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::error::{Error, Result};

/// Stable SHA-256 digest of a serializable value.
///
/// The value is converted to a `serde_json::Value` first; JSON object keys
/// are kept in a sorted map, so two structurally identical values always
/// produce the same digest regardless of field declaration order.
pub fn canonical_digest<T: Serialize>(value: &T) -> Result<String> {
    let canonical = serde_json::to_value(value)
        .and_then(|v| serde_json::to_string(&v))
        .map_err(|e| Error::Internal(anyhow::anyhow!("canonical serialization failed: {e}")))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Sample {
        url: String,
        depth: u32,
    }

    #[test]
    fn identical_values_same_digest() {
        let a = Sample {
            url: "http://example.test".into(),
            depth: 2,
        };
        let b = Sample {
            url: "http://example.test".into(),
            depth: 2,
        };
        assert_eq!(canonical_digest(&a).unwrap(), canonical_digest(&b).unwrap());
    }

    #[test]
    fn different_values_different_digest() {
        let a = Sample {
            url: "http://example.test/a".into(),
            depth: 2,
        };
        let b = Sample {
            url: "http://example.test/b".into(),
            depth: 2,
        };
        assert_ne!(canonical_digest(&a).unwrap(), canonical_digest(&b).unwrap());
    }

    #[test]
    fn digest_is_64_hex_chars() {
        let digest = sha256_hex(b"test content");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn map_key_order_does_not_matter() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"url": "http://x.test", "depth": 1}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"depth": 1, "url": "http://x.test"}"#).unwrap();
        assert_eq!(canonical_digest(&a).unwrap(), canonical_digest(&b).unwrap());
    }
}
