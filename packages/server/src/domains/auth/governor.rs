//! Identity and rate governor.
//!
//! Credentials resolve through the injected `KeyValidator`; quotas are
//! token buckets per `(principal, operation class)`. Bucket state is
//! process-local; a background sync folds each instance's consumption into
//! the `rate_buckets` collection via CAS, so horizontally scaled replicas
//! converge without a shared lock. Exact global enforcement is not a goal:
//! a violator is bounded by `capacity x instances` until the next sync.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::error::{Error, Result};
use crate::kernel::{Clock, KeyValidator, Service};
use crate::store::{collections, MetadataStore};

use super::principal::{Operation, OperationClass, Principal};

#[derive(Debug, Clone, Copy)]
pub struct GovernorConfig {
    /// Bucket capacity (burst).
    pub burst: f64,
    /// Steady refill rate, tokens per second.
    pub refill_per_sec: f64,
    /// How often local consumption is folded into the store.
    pub sync_interval: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            burst: 20.0,
            refill_per_sec: 10.0,
            sync_interval: Duration::from_secs(10),
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
    /// Requests admitted by this instance since process start.
    consumed_total: f64,
    /// Peer consumption already deducted from this bucket.
    peers_seen: f64,
}

pub struct Governor {
    keys: Arc<dyn KeyValidator>,
    store: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    config: GovernorConfig,
    instance_id: String,
    buckets: Mutex<HashMap<(String, OperationClass), Bucket>>,
}

impl Governor {
    pub fn new(
        keys: Arc<dyn KeyValidator>,
        store: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
        config: GovernorConfig,
    ) -> Self {
        Self {
            keys,
            store,
            clock,
            config,
            instance_id: format!("governor-{}", Uuid::new_v4()),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a credential and admit the operation, or explain why not.
    pub async fn authorize(&self, credential: &str, operation: Operation) -> Result<Principal> {
        let record = self.keys.validate(credential).await?;
        let now = self.clock.now();

        if let Some(expires_at) = record.expires_at {
            if expires_at <= now {
                return Err(Error::Unauthenticated("API key expired".into()));
            }
        }

        let class = operation.class();
        if !record.role.allows(class) {
            return Err(Error::Unauthorized(format!(
                "role {} may not perform {:?} operations",
                record.role,
                class.as_str()
            )));
        }

        self.take_token(&record.principal_id, class, now)?;
        Ok(Principal {
            id: record.principal_id,
            tenant_id: record.tenant_id,
            role: record.role,
        })
    }

    fn take_token(&self, principal: &str, class: OperationClass, now: DateTime<Utc>) -> Result<()> {
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let bucket = buckets
            .entry((principal.to_string(), class))
            .or_insert_with(|| Bucket {
                tokens: self.config.burst,
                last_refill: now,
                consumed_total: 0.0,
                peers_seen: 0.0,
            });

        let elapsed = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1_000.0;
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_per_sec).min(self.config.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.consumed_total += 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_seconds = (deficit / self.config.refill_per_sec).ceil().max(1.0) as u64;
            Err(Error::RateLimited {
                retry_after_seconds,
            })
        }
    }

    /// Fold local consumption into the shared bucket documents and deduct
    /// peers' consumption from the local buckets.
    pub async fn sync(&self) -> Result<()> {
        let snapshot: Vec<(String, OperationClass, f64)> = {
            let buckets = self.buckets.lock().expect("bucket lock poisoned");
            buckets
                .iter()
                .map(|((principal, class), bucket)| {
                    (principal.clone(), *class, bucket.consumed_total)
                })
                .collect()
        };

        for (principal, class, consumed_total) in snapshot {
            let doc_id = format!("{principal}:{}", class.as_str());
            let peers_total = self
                .publish_consumption(&doc_id, consumed_total)
                .await
                .unwrap_or_else(|e| {
                    warn!(bucket = %doc_id, error = %e, "rate bucket sync failed");
                    0.0
                });

            let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
            if let Some(bucket) = buckets.get_mut(&(principal.clone(), class)) {
                let newly_seen = (peers_total - bucket.peers_seen).max(0.0);
                if newly_seen > 0.0 {
                    bucket.tokens = (bucket.tokens - newly_seen).max(0.0);
                    bucket.peers_seen = peers_total;
                    debug!(bucket = %doc_id, newly_seen, "deducted peer consumption");
                }
            }
        }
        Ok(())
    }

    /// Write this instance's running total; returns the sum of the other
    /// instances' totals.
    async fn publish_consumption(&self, doc_id: &str, consumed_total: f64) -> Result<f64> {
        const MAX_CAS_RETRIES: usize = 3;
        for _ in 0..MAX_CAS_RETRIES {
            match self.store.get(collections::RATE_BUCKETS, doc_id).await? {
                None => {
                    let body = json!({"instances": {&self.instance_id: consumed_total}});
                    match self.store.insert(collections::RATE_BUCKETS, doc_id, body).await {
                        Ok(_) => return Ok(0.0),
                        Err(Error::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Some(doc) => {
                    let mut instances: HashMap<String, f64> = doc
                        .body
                        .get("instances")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default();
                    instances.insert(self.instance_id.clone(), consumed_total);
                    let peers_total: f64 = instances
                        .iter()
                        .filter(|(id, _)| *id != &self.instance_id)
                        .map(|(_, total)| total)
                        .sum();

                    let body = json!({ "instances": instances });
                    match self
                        .store
                        .put(collections::RATE_BUCKETS, doc_id, doc.version, body)
                        .await
                    {
                        Ok(_) => return Ok(peers_total),
                        Err(Error::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Err(Error::Conflict(format!(
            "rate bucket {doc_id} contended beyond retry budget"
        )))
    }
}

/// Periodic rate-bucket synchronisation across instances.
pub struct RateSync {
    governor: Arc<Governor>,
}

impl RateSync {
    pub fn new(governor: Arc<Governor>) -> Self {
        Self { governor }
    }
}

#[async_trait::async_trait]
impl Service for RateSync {
    fn name(&self) -> &'static str {
        "rate-sync"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> AnyResult<()> {
        let interval = self.governor.config.sync_interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.governor.sync().await {
                        warn!(error = %e, "rate sync pass failed");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TenantId;
    use crate::domains::auth::Role;
    use crate::kernel::test_dependencies::ManualClock;
    use crate::kernel::{KeyRecord, StaticKeyValidator};
    use crate::store::MemoryMetadataStore;

    fn governor(config: GovernorConfig) -> (Governor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let keys = StaticKeyValidator::new()
            .with_key(
                "dev-key",
                KeyRecord {
                    principal_id: "dev".into(),
                    tenant_id: TenantId::new(),
                    role: Role::Developer,
                    expires_at: None,
                },
            )
            .with_key(
                "analyst-key",
                KeyRecord {
                    principal_id: "analyst".into(),
                    tenant_id: TenantId::new(),
                    role: Role::Analyst,
                    expires_at: None,
                },
            )
            .with_key(
                "stale-key",
                KeyRecord {
                    principal_id: "stale".into(),
                    tenant_id: TenantId::new(),
                    role: Role::Developer,
                    expires_at: Some(clock.now() - chrono::Duration::hours(1)),
                },
            );
        let governor = Governor::new(
            Arc::new(keys),
            Arc::new(MemoryMetadataStore::new()),
            clock.clone(),
            config,
        );
        (governor, clock)
    }

    #[tokio::test]
    async fn valid_key_yields_principal() {
        let (governor, _clock) = governor(GovernorConfig::default());
        let principal = governor
            .authorize("dev-key", Operation::SubmitJob)
            .await
            .unwrap();
        assert_eq!(principal.id, "dev");
        assert_eq!(principal.role, Role::Developer);
    }

    #[tokio::test]
    async fn unknown_and_expired_keys_fail_unauthenticated() {
        let (governor, _clock) = governor(GovernorConfig::default());
        assert!(matches!(
            governor.authorize("nope", Operation::GetJob).await,
            Err(Error::Unauthenticated(_))
        ));
        assert!(matches!(
            governor.authorize("stale-key", Operation::GetJob).await,
            Err(Error::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn analyst_cannot_write() {
        let (governor, _clock) = governor(GovernorConfig::default());
        assert!(matches!(
            governor.authorize("analyst-key", Operation::SubmitJob).await,
            Err(Error::Unauthorized(_))
        ));
        assert!(governor
            .authorize("analyst-key", Operation::GetJob)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn burst_is_bounded_by_capacity() {
        let (governor, _clock) = governor(GovernorConfig {
            burst: 5.0,
            refill_per_sec: 1.0,
            sync_interval: Duration::from_secs(10),
        });

        for _ in 0..5 {
            governor
                .authorize("dev-key", Operation::SubmitJob)
                .await
                .unwrap();
        }
        let denied = governor.authorize("dev-key", Operation::SubmitJob).await;
        match denied {
            Err(Error::RateLimited {
                retry_after_seconds,
            }) => assert!(retry_after_seconds >= 1),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bucket_refills_at_steady_rate() {
        let (governor, clock) = governor(GovernorConfig {
            burst: 2.0,
            refill_per_sec: 1.0,
            sync_interval: Duration::from_secs(10),
        });

        governor.authorize("dev-key", Operation::SubmitJob).await.unwrap();
        governor.authorize("dev-key", Operation::SubmitJob).await.unwrap();
        assert!(governor
            .authorize("dev-key", Operation::SubmitJob)
            .await
            .is_err());

        clock.advance(chrono::Duration::seconds(1));
        governor.authorize("dev-key", Operation::SubmitJob).await.unwrap();
        assert!(governor
            .authorize("dev-key", Operation::SubmitJob)
            .await
            .is_err());
    }

    /// Property: in any window W, admitted requests <= C + R*W within one
    /// refill of tolerance.
    #[tokio::test]
    async fn admitted_requests_bounded_by_capacity_plus_rate() {
        let capacity = 10.0;
        let rate = 5.0;
        let (governor, clock) = governor(GovernorConfig {
            burst: capacity,
            refill_per_sec: rate,
            sync_interval: Duration::from_secs(10),
        });

        let window_seconds = 4;
        let mut admitted = 0u64;
        for _ in 0..(window_seconds * 10) {
            for _ in 0..20 {
                if governor
                    .authorize("dev-key", Operation::SubmitJob)
                    .await
                    .is_ok()
                {
                    admitted += 1;
                }
            }
            clock.advance(chrono::Duration::milliseconds(100));
        }

        let bound = capacity + rate * window_seconds as f64 + rate;
        assert!(
            (admitted as f64) <= bound,
            "admitted {admitted} exceeds bound {bound}"
        );
    }

    #[tokio::test]
    async fn read_and_write_classes_use_separate_buckets() {
        let (governor, _clock) = governor(GovernorConfig {
            burst: 1.0,
            refill_per_sec: 0.1,
            sync_interval: Duration::from_secs(10),
        });

        governor.authorize("dev-key", Operation::SubmitJob).await.unwrap();
        assert!(governor
            .authorize("dev-key", Operation::SubmitJob)
            .await
            .is_err());
        // The read bucket is untouched.
        governor.authorize("dev-key", Operation::GetJob).await.unwrap();
    }

    #[tokio::test]
    async fn sync_deducts_peer_consumption() {
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let keys = Arc::new(StaticKeyValidator::new().with_key(
            "dev-key",
            KeyRecord {
                principal_id: "dev".into(),
                tenant_id: TenantId::new(),
                role: Role::Developer,
                expires_at: None,
            },
        ));
        let config = GovernorConfig {
            burst: 10.0,
            refill_per_sec: 0.001,
            sync_interval: Duration::from_secs(10),
        };
        let a = Governor::new(keys.clone(), store.clone(), clock.clone(), config);
        let b = Governor::new(keys, store, clock, config);

        // Each instance admits 4 requests, then they sync twice so peer
        // totals propagate both ways.
        for _ in 0..4 {
            a.authorize("dev-key", Operation::SubmitJob).await.unwrap();
            b.authorize("dev-key", Operation::SubmitJob).await.unwrap();
        }
        a.sync().await.unwrap();
        b.sync().await.unwrap();
        a.sync().await.unwrap();

        // Instance A saw B's 4 requests: 10 - 4 local - 4 peer = 2 left.
        let mut remaining = 0;
        while a.authorize("dev-key", Operation::SubmitJob).await.is_ok() {
            remaining += 1;
            if remaining > 10 {
                break;
            }
        }
        assert_eq!(remaining, 2);
    }
}
