//! Static API key table.
//!
//! Key generation and rotation live outside the engine; this validator
//! resolves bearer keys from a fixed table, typically loaded from the
//! `API_KEYS` environment variable:
//!
//! ```text
//! API_KEYS=<key>:<tenant-uuid>:<role>[:<expires-rfc3339>],...
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;

use crate::common::error::{Error, Result};
use crate::common::TenantId;
use crate::domains::auth::Role;

use super::{KeyRecord, KeyValidator};

#[derive(Default)]
pub struct StaticKeyValidator {
    keys: HashMap<String, KeyRecord>,
}

impl StaticKeyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `API_KEYS` format.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let mut validator = Self::new();
        for entry in spec.split(',').filter(|e| !e.trim().is_empty()) {
            let parts: Vec<&str> = entry.trim().split(':').collect();
            if parts.len() < 3 {
                return Err(Error::InvalidRequest(format!(
                    "malformed API key entry: expected key:tenant:role, got {entry:?}"
                )));
            }
            let key = parts[0].to_string();
            let tenant_id: TenantId = parts[1]
                .parse()
                .map_err(|_| Error::InvalidRequest(format!("bad tenant id in key entry {entry:?}")))?;
            let role: Role = parts[2].parse()?;
            // Expiry timestamps contain ':', so rejoin the remainder.
            let expires_at = if parts.len() > 3 {
                let raw = parts[3..].join(":");
                Some(
                    DateTime::parse_from_rfc3339(&raw)
                        .map_err(|_| {
                            Error::InvalidRequest(format!("bad expiry in key entry {entry:?}"))
                        })?
                        .to_utc(),
                )
            } else {
                None
            };

            validator.keys.insert(
                key.clone(),
                KeyRecord {
                    principal_id: format!("key-{}", &key[..key.len().min(8)]),
                    tenant_id,
                    role,
                    expires_at,
                },
            );
        }
        Ok(validator)
    }

    pub fn with_key(mut self, key: impl Into<String>, record: KeyRecord) -> Self {
        self.keys.insert(key.into(), record);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeyValidator for StaticKeyValidator {
    async fn validate(&self, key: &str) -> Result<KeyRecord> {
        self.keys
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Unauthenticated("unknown API key".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn parses_spec_and_validates() {
        let tenant = Uuid::now_v7();
        let spec = format!("alpha:{tenant}:developer,beta:{tenant}:admin:2030-01-01T00:00:00Z");
        let validator = StaticKeyValidator::from_spec(&spec).unwrap();

        let record = validator.validate("alpha").await.unwrap();
        assert_eq!(record.role, Role::Developer);
        assert_eq!(record.tenant_id, TenantId::from_uuid(tenant));
        assert!(record.expires_at.is_none());

        let record = validator.validate("beta").await.unwrap();
        assert_eq!(record.role, Role::Admin);
        assert!(record.expires_at.is_some());
    }

    #[tokio::test]
    async fn unknown_key_is_unauthenticated() {
        let validator = StaticKeyValidator::new();
        assert!(matches!(
            validator.validate("nope").await,
            Err(Error::Unauthenticated(_))
        ));
    }

    #[test]
    fn malformed_entry_rejected() {
        assert!(StaticKeyValidator::from_spec("just-a-key").is_err());
    }
}
