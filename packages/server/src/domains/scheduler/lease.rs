//! Leader election via a renewable lease document.
//!
//! The active scheduler holds `scheduler_lease/leader` and renews it well
//! inside its TTL; followers poll and take over once the lease expires.
//! CAS on the document version arbitrates every hand-off.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::common::error::{Error, Result};
use crate::kernel::Clock;
use crate::store::{collections, encode_body, MetadataStore};

const LEASE_DOC_ID: &str = "leader";

#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub renew_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(15),
            renew_interval: Duration::seconds(5),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseDoc {
    holder: String,
    expires_at: DateTime<Utc>,
}

struct LeaseState {
    held: bool,
    last_renewal: Option<DateTime<Utc>>,
}

pub struct LeaderLease {
    store: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    holder_id: String,
    config: LeaseConfig,
    state: Mutex<LeaseState>,
}

impl LeaderLease {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
        holder_id: impl Into<String>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            store,
            clock,
            holder_id: holder_id.into(),
            config,
            state: Mutex::new(LeaseState {
                held: false,
                last_renewal: None,
            }),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().expect("lease state poisoned").held
    }

    /// Acquire or renew the lease as appropriate. Cheap between renewal
    /// intervals while held. Returns whether this instance is the leader.
    pub async fn maintain(&self) -> Result<bool> {
        let now = self.clock.now();
        {
            let state = self.state.lock().expect("lease state poisoned");
            if state.held {
                if let Some(last) = state.last_renewal {
                    if now - last < self.config.renew_interval {
                        return Ok(true);
                    }
                }
            }
        }

        let outcome = self.acquire_or_renew(now).await;
        let mut state = self.state.lock().expect("lease state poisoned");
        match outcome {
            Ok(held) => {
                if state.held && !held {
                    tracing::warn!(holder = %self.holder_id, "scheduler lease lost");
                }
                if held {
                    state.last_renewal = Some(now);
                }
                state.held = held;
                Ok(held)
            }
            Err(e) => {
                // Treat store trouble as lease loss so the scheduler
                // quiesces rather than double-runs.
                state.held = false;
                Err(e)
            }
        }
    }

    async fn acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = LeaseDoc {
            holder: self.holder_id.clone(),
            expires_at: now + self.config.ttl,
        };

        match self.store.get(collections::SCHEDULER_LEASE, LEASE_DOC_ID).await? {
            None => {
                match self
                    .store
                    .insert(collections::SCHEDULER_LEASE, LEASE_DOC_ID, encode_body(&lease)?)
                    .await
                {
                    Ok(_) => {
                        tracing::info!(holder = %self.holder_id, "scheduler lease acquired");
                        Ok(true)
                    }
                    Err(Error::Conflict(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Some(doc) => {
                let current: LeaseDoc = doc.body_as()?;
                let ours = current.holder == self.holder_id;
                if !ours && current.expires_at > now {
                    return Ok(false);
                }
                match self
                    .store
                    .put(
                        collections::SCHEDULER_LEASE,
                        LEASE_DOC_ID,
                        doc.version,
                        encode_body(&lease)?,
                    )
                    .await
                {
                    Ok(_) => {
                        if !ours {
                            tracing::info!(
                                holder = %self.holder_id,
                                previous = %current.holder,
                                "scheduler lease taken over"
                            );
                        }
                        Ok(true)
                    }
                    Err(Error::Conflict(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Drop the lease so a follower can take over immediately.
    pub async fn release(&self) -> Result<()> {
        let held = {
            let mut state = self.state.lock().expect("lease state poisoned");
            let was_held = state.held;
            state.held = false;
            state.last_renewal = None;
            was_held
        };
        if !held {
            return Ok(());
        }

        if let Some(doc) = self.store.get(collections::SCHEDULER_LEASE, LEASE_DOC_ID).await? {
            let current: LeaseDoc = doc.body_as()?;
            if current.holder == self.holder_id {
                // Best effort; an expired lease falls over anyway.
                let _ = self
                    .store
                    .delete(collections::SCHEDULER_LEASE, LEASE_DOC_ID)
                    .await;
            }
        }
        tracing::info!(holder = %self.holder_id, "scheduler lease released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_dependencies::ManualClock;
    use crate::store::MemoryMetadataStore;

    fn setup() -> (Arc<dyn MetadataStore>, Arc<ManualClock>) {
        (
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(ManualClock::new(Utc::now())),
        )
    }

    fn lease(
        store: &Arc<dyn MetadataStore>,
        clock: &Arc<ManualClock>,
        holder: &str,
    ) -> LeaderLease {
        LeaderLease::new(store.clone(), clock.clone(), holder, LeaseConfig::default())
    }

    #[tokio::test]
    async fn first_instance_wins_and_follower_waits() {
        let (store, clock) = setup();
        let a = lease(&store, &clock, "a");
        let b = lease(&store, &clock, "b");

        assert!(a.maintain().await.unwrap());
        assert!(!b.maintain().await.unwrap());
        assert!(a.is_held());
        assert!(!b.is_held());
    }

    #[tokio::test]
    async fn follower_takes_over_after_expiry() {
        let (store, clock) = setup();
        let a = lease(&store, &clock, "a");
        let b = lease(&store, &clock, "b");

        assert!(a.maintain().await.unwrap());
        clock.advance(Duration::seconds(16));
        assert!(b.maintain().await.unwrap());

        // The old leader notices it lost on its next renewal attempt.
        clock.advance(Duration::seconds(6));
        assert!(b.maintain().await.unwrap());
        assert!(!a.maintain().await.unwrap());
    }

    #[tokio::test]
    async fn leader_renews_within_ttl() {
        let (store, clock) = setup();
        let a = lease(&store, &clock, "a");
        let b = lease(&store, &clock, "b");

        assert!(a.maintain().await.unwrap());
        for _ in 0..6 {
            clock.advance(Duration::seconds(5));
            assert!(a.maintain().await.unwrap());
            assert!(!b.maintain().await.unwrap());
        }
    }

    #[tokio::test]
    async fn release_hands_over_immediately() {
        let (store, clock) = setup();
        let a = lease(&store, &clock, "a");
        let b = lease(&store, &clock, "b");

        assert!(a.maintain().await.unwrap());
        a.release().await.unwrap();
        assert!(b.maintain().await.unwrap());
    }
}
