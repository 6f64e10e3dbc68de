//! Typed durable dispatch queues, one per job kind.
//!
//! Delivery semantics: at-least-once with per-message leases, strict
//! publish-order delivery within an ordering key, dead-letter routing once a
//! message exhausts its retry budget, priority-weighted pull with
//! anti-starvation promotion, and high/low-water flow control on publish.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::common::error::Result;
use crate::common::{JobId, JobKind, Priority, RetryPolicy, TenantId};

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryBus, MemoryQueue, QueueLimits};
pub use postgres::{PostgresBus, PostgresQueue};

/// Low-priority messages older than this are promoted to the front band.
pub const STARVATION_PROMOTION_SECS: i64 = 600;

/// [`STARVATION_PROMOTION_SECS`] as a duration.
pub fn starvation_promotion_after() -> Duration {
    Duration::seconds(STARVATION_PROMOTION_SECS)
}

/// A unit of dispatch: one requested run of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub priority: Priority,
    pub ordering_key: Option<String>,
    pub retry: RetryPolicy,
    pub timeout_ms: i64,
    pub enqueued_at: DateTime<Utc>,
}

/// Lease on a delivered message. The token rotates on every delivery, so a
/// stale holder (crashed worker, expired lease) cannot ack someone else's
/// redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseToken {
    pub message_id: Uuid,
    pub token: Uuid,
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub lease: LeaseToken,
    pub request: ExecutionRequest,
    /// 1-indexed count of deliveries of this message, including this one.
    pub delivery_attempt: i32,
    pub ack_deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub inflight: usize,
    pub dlq_depth: usize,
}

impl QueueStats {
    pub fn outstanding(&self) -> usize {
        self.ready + self.inflight
    }
}

/// Callback invoked when a message is transferred to the dead-letter queue,
/// so the execution recorder can persist the `dead_lettered` transition.
#[async_trait]
pub trait DlqObserver: Send + Sync {
    async fn on_dead_letter(
        &self,
        request: &ExecutionRequest,
        delivery_attempts: i32,
        last_error: Option<&str>,
    );
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Durably enqueue a request. Fails with `Unavailable` while the queue
    /// is above its high-water mark (until it drains to low-water).
    async fn publish(&self, request: ExecutionRequest) -> Result<()>;

    /// Pull up to `max_batch` messages. Each carries a lease that must be
    /// acked, nacked, or extended before `ack_deadline`, else it redelivers.
    async fn pull(
        &self,
        subscriber_id: &str,
        max_batch: usize,
        ack_deadline: Duration,
    ) -> Result<Vec<Delivery>>;

    async fn ack(&self, lease: &LeaseToken) -> Result<()>;

    /// Fail the delivery. The message becomes re-deliverable after
    /// `requeue_delay` (jittered ±20%), or is routed to the DLQ if its
    /// delivery budget is exhausted.
    async fn nack(&self, lease: &LeaseToken, requeue_delay: Duration) -> Result<()>;

    /// Push the lease deadline out to `now + additional`.
    async fn extend(&self, lease: &LeaseToken, additional: Duration) -> Result<()>;

    /// Best-effort removal of not-yet-delivered messages for a job
    /// (cancellation support). Returns the number removed.
    async fn purge_job(&self, job_id: JobId) -> Result<usize>;

    /// Move dead-lettered messages for the given jobs back onto the main
    /// queue. Returns the jobs that actually had messages redriven.
    async fn redrive(&self, job_ids: &[JobId]) -> Result<Vec<JobId>>;

    /// Jobs currently parked in the DLQ, oldest first.
    async fn dlq_jobs(&self) -> Result<Vec<JobId>>;

    async fn stats(&self) -> Result<QueueStats>;
}

/// The bus: one durable queue per job kind.
pub trait MessageBus: Send + Sync {
    fn queue(&self, kind: JobKind) -> Arc<dyn DispatchQueue>;

    /// Install the dead-letter observer on every queue.
    fn set_observer(&self, observer: Arc<dyn DlqObserver>);
}

/// Apply ±20% jitter to a requeue delay.
pub(crate) fn jittered(delay: Duration) -> Duration {
    use rand::Rng;
    let factor: f64 = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::milliseconds((delay.num_milliseconds() as f64 * factor) as i64)
}
