//! In-memory dispatch queue.
//!
//! Single-process backend with the full delivery contract: ordering-key
//! serialization, lease expiry, dead-letter routing, weighted priority pull,
//! and flow control. State sits behind one mutex; lease expiry is evaluated
//! lazily on every pull through the injected clock, which keeps the queue
//! deterministic under test.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::common::error::{Error, Result};
use crate::common::{JobId, JobKind, Priority};
use crate::kernel::Clock;

use super::{
    jittered, starvation_promotion_after, Delivery, DispatchQueue, DlqObserver, ExecutionRequest,
    LeaseToken, MessageBus, QueueStats,
};

/// Flow-control water marks for one queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub high_water: usize,
    pub low_water: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            high_water: 1_000,
            low_water: 800,
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    id: Uuid,
    request: ExecutionRequest,
    delivery_attempts: i32,
    available_at: DateTime<Utc>,
    seq: u64,
    last_error: Option<String>,
}

#[derive(Debug)]
struct InFlight {
    stored: Stored,
    token: Uuid,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    ready: Vec<Stored>,
    inflight: HashMap<Uuid, InFlight>,
    dlq: Vec<Stored>,
    paused: bool,
}

struct DlqTransfer {
    request: ExecutionRequest,
    delivery_attempts: i32,
    last_error: Option<String>,
}

pub struct MemoryQueue {
    kind: JobKind,
    clock: Arc<dyn Clock>,
    limits: QueueLimits,
    observer: Mutex<Option<Arc<dyn DlqObserver>>>,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new(kind: JobKind, clock: Arc<dyn Clock>, limits: QueueLimits) -> Self {
        Self {
            kind,
            clock,
            limits,
            observer: Mutex::new(None),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn DlqObserver>) {
        *self.observer.lock().expect("observer lock poisoned") = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn DlqObserver>> {
        self.observer.lock().expect("observer lock poisoned").clone()
    }

    async fn notify_dead_letters(&self, transfers: Vec<DlqTransfer>) {
        if transfers.is_empty() {
            return;
        }
        let observer = self.observer();
        for transfer in transfers {
            tracing::warn!(
                queue = %self.kind,
                job_id = %transfer.request.job_id,
                delivery_attempts = transfer.delivery_attempts,
                "message dead-lettered"
            );
            if let Some(observer) = &observer {
                observer
                    .on_dead_letter(
                        &transfer.request,
                        transfer.delivery_attempts,
                        transfer.last_error.as_deref(),
                    )
                    .await;
            }
        }
    }

    /// Move expired leases back to ready, dead-lettering messages whose
    /// delivery budget is spent. Called with the lock held.
    fn reap_expired(inner: &mut Inner, now: DateTime<Utc>, transfers: &mut Vec<DlqTransfer>) {
        let expired: Vec<Uuid> = inner
            .inflight
            .iter()
            .filter(|(_, inflight)| inflight.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let inflight = inner.inflight.remove(&id).expect("expired lease present");
            let mut stored = inflight.stored;
            stored.last_error = Some("lease expired".into());
            if stored.delivery_attempts >= stored.request.retry.max_attempts {
                transfers.push(DlqTransfer {
                    request: stored.request.clone(),
                    delivery_attempts: stored.delivery_attempts,
                    last_error: stored.last_error.clone(),
                });
                inner.dlq.push(stored);
            } else {
                stored.available_at = now;
                inner.ready.push(stored);
            }
        }
    }

    /// A ready message is eligible when it is due and nothing earlier in its
    /// ordering key is still outstanding (ready with a lower sequence number
    /// or in flight). Messages without a key only gate on their due time.
    fn eligible_ids(inner: &Inner, now: DateTime<Utc>) -> Vec<Uuid> {
        inner
            .ready
            .iter()
            .filter(|msg| {
                if msg.available_at > now {
                    return false;
                }
                let Some(key) = &msg.request.ordering_key else {
                    return true;
                };
                let blocked_inflight = inner
                    .inflight
                    .values()
                    .any(|inflight| inflight.stored.request.ordering_key.as_ref() == Some(key));
                if blocked_inflight {
                    return false;
                }
                !inner.ready.iter().any(|other| {
                    other.request.ordering_key.as_ref() == Some(key) && other.seq < msg.seq
                })
            })
            .map(|msg| msg.id)
            .collect()
    }

    /// Weighted round-robin selection across priority bands (8:4:1), with
    /// low-priority messages past the starvation threshold promoted into the
    /// top band.
    fn select_batch(inner: &Inner, eligible: &[Uuid], now: DateTime<Utc>, max: usize) -> Vec<Uuid> {
        let promotion_cutoff = now - starvation_promotion_after();

        let mut bands: [Vec<(u64, Uuid)>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for msg in &inner.ready {
            if !eligible.contains(&msg.id) {
                continue;
            }
            let promoted = msg.request.priority == Priority::Low
                && msg.request.enqueued_at <= promotion_cutoff;
            let band = if promoted {
                0
            } else {
                msg.request.priority.rank() as usize
            };
            bands[band].push((msg.seq, msg.id));
        }
        for band in &mut bands {
            band.sort_unstable();
        }

        let weights = [
            Priority::High.weight() as usize,
            Priority::Normal.weight() as usize,
            Priority::Low.weight() as usize,
        ];
        let mut cursors = [0usize; 3];
        let mut picked = Vec::with_capacity(max);
        while picked.len() < max {
            let mut progressed = false;
            for (band, &weight) in weights.iter().enumerate() {
                for _ in 0..weight {
                    if picked.len() >= max {
                        break;
                    }
                    if cursors[band] < bands[band].len() {
                        picked.push(bands[band][cursors[band]].1);
                        cursors[band] += 1;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        picked
    }

    fn take_ready(inner: &mut Inner, id: Uuid) -> Stored {
        let idx = inner
            .ready
            .iter()
            .position(|msg| msg.id == id)
            .expect("selected message is ready");
        inner.ready.swap_remove(idx)
    }
}

#[async_trait]
impl DispatchQueue for MemoryQueue {
    async fn publish(&self, request: ExecutionRequest) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let outstanding = inner.ready.len() + inner.inflight.len();
        if inner.paused {
            if outstanding > self.limits.low_water {
                return Err(Error::Unavailable(format!("queue {} full", self.kind)));
            }
            inner.paused = false;
        } else if outstanding >= self.limits.high_water {
            inner.paused = true;
            return Err(Error::Unavailable(format!("queue {} full", self.kind)));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.ready.push(Stored {
            id: Uuid::new_v4(),
            request,
            delivery_attempts: 0,
            available_at: now,
            seq,
            last_error: None,
        });
        Ok(())
    }

    async fn pull(
        &self,
        subscriber_id: &str,
        max_batch: usize,
        ack_deadline: Duration,
    ) -> Result<Vec<Delivery>> {
        let now = self.clock.now();
        let mut transfers = Vec::new();
        let deliveries = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            Self::reap_expired(&mut inner, now, &mut transfers);

            let eligible = Self::eligible_ids(&inner, now);
            let picked = Self::select_batch(&inner, &eligible, now, max_batch);

            let mut deliveries = Vec::with_capacity(picked.len());
            for id in picked {
                let mut stored = Self::take_ready(&mut inner, id);
                stored.delivery_attempts += 1;
                let token = Uuid::new_v4();
                let deadline = now + ack_deadline;
                deliveries.push(Delivery {
                    lease: LeaseToken {
                        message_id: stored.id,
                        token,
                    },
                    request: stored.request.clone(),
                    delivery_attempt: stored.delivery_attempts,
                    ack_deadline: deadline,
                });
                inner.inflight.insert(
                    stored.id,
                    InFlight {
                        stored,
                        token,
                        deadline,
                    },
                );
            }
            deliveries
        };

        self.notify_dead_letters(transfers).await;
        if !deliveries.is_empty() {
            tracing::debug!(
                queue = %self.kind,
                subscriber = subscriber_id,
                count = deliveries.len(),
                "delivered batch"
            );
        }
        Ok(deliveries)
    }

    async fn ack(&self, lease: &LeaseToken) -> Result<()> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        match inner.inflight.get(&lease.message_id) {
            Some(inflight) if inflight.token == lease.token => {
                inner.inflight.remove(&lease.message_id);
                Ok(())
            }
            _ => Err(Error::Conflict("lease expired or message gone".into())),
        }
    }

    async fn nack(&self, lease: &LeaseToken, requeue_delay: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut transfers = Vec::new();
        let result = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            match inner.inflight.get(&lease.message_id) {
                Some(inflight) if inflight.token == lease.token => {
                    let inflight = inner.inflight.remove(&lease.message_id).expect("checked");
                    let mut stored = inflight.stored;
                    if stored.delivery_attempts >= stored.request.retry.max_attempts {
                        transfers.push(DlqTransfer {
                            request: stored.request.clone(),
                            delivery_attempts: stored.delivery_attempts,
                            last_error: stored.last_error.clone(),
                        });
                        inner.dlq.push(stored);
                    } else {
                        stored.available_at = now + jittered(requeue_delay);
                        inner.ready.push(stored);
                    }
                    Ok(())
                }
                _ => Err(Error::Conflict("lease expired or message gone".into())),
            }
        };
        self.notify_dead_letters(transfers).await;
        result
    }

    async fn extend(&self, lease: &LeaseToken, additional: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        match inner.inflight.get_mut(&lease.message_id) {
            Some(inflight) if inflight.token == lease.token => {
                inflight.deadline = now + additional;
                Ok(())
            }
            _ => Err(Error::Conflict("lease expired or message gone".into())),
        }
    }

    async fn purge_job(&self, job_id: JobId) -> Result<usize> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let before = inner.ready.len();
        inner.ready.retain(|msg| msg.request.job_id != job_id);
        Ok(before - inner.ready.len())
    }

    async fn redrive(&self, job_ids: &[JobId]) -> Result<Vec<JobId>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let mut redriven = Vec::new();
        let mut remaining = Vec::new();
        let drained: Vec<Stored> = inner.dlq.drain(..).collect();
        for mut stored in drained {
            if job_ids.contains(&stored.request.job_id) {
                stored.delivery_attempts = 0;
                stored.available_at = now;
                stored.last_error = None;
                if !redriven.contains(&stored.request.job_id) {
                    redriven.push(stored.request.job_id);
                }
                inner.ready.push(stored);
            } else {
                remaining.push(stored);
            }
        }
        inner.dlq = remaining;
        Ok(redriven)
    }

    async fn dlq_jobs(&self) -> Result<Vec<JobId>> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut parked: Vec<&Stored> = inner.dlq.iter().collect();
        parked.sort_by_key(|msg| msg.seq);
        let mut jobs = Vec::new();
        for msg in parked {
            if !jobs.contains(&msg.request.job_id) {
                jobs.push(msg.request.job_id);
            }
        }
        Ok(jobs)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        Ok(QueueStats {
            ready: inner.ready.len(),
            inflight: inner.inflight.len(),
            dlq_depth: inner.dlq.len(),
        })
    }
}

/// One in-memory queue per job kind.
pub struct InMemoryBus {
    queues: HashMap<JobKind, Arc<MemoryQueue>>,
}

impl InMemoryBus {
    pub fn new(clock: Arc<dyn Clock>, limits: QueueLimits) -> Self {
        let queues = JobKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    Arc::new(MemoryQueue::new(kind, clock.clone(), limits)),
                )
            })
            .collect();
        Self { queues }
    }
}

impl MessageBus for InMemoryBus {
    fn queue(&self, kind: JobKind) -> Arc<dyn DispatchQueue> {
        self.queues.get(&kind).expect("queue exists for kind").clone()
    }

    fn set_observer(&self, observer: Arc<dyn DlqObserver>) {
        for queue in self.queues.values() {
            queue.set_observer(observer.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RetryPolicy;
    use crate::common::TenantId;
    use crate::kernel::test_dependencies::ManualClock;

    fn request(priority: Priority, ordering_key: Option<&str>, max_attempts: i32) -> ExecutionRequest {
        ExecutionRequest {
            job_id: JobId::new(),
            tenant_id: TenantId::new(),
            kind: JobKind::Scrape,
            priority,
            ordering_key: ordering_key.map(String::from),
            retry: RetryPolicy {
                max_attempts,
                initial_backoff_ms: 100,
                multiplier: 2.0,
                max_backoff_ms: 1_000,
            },
            timeout_ms: 30_000,
            enqueued_at: Utc::now(),
        }
    }

    fn queue_with_clock() -> (MemoryQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = MemoryQueue::new(JobKind::Scrape, clock.clone(), QueueLimits::default());
        (queue, clock)
    }

    #[tokio::test]
    async fn delivers_published_message() {
        let (queue, _clock) = queue_with_clock();
        let req = request(Priority::Normal, None, 5);
        queue.publish(req.clone()).await.unwrap();

        let batch = queue.pull("w1", 10, Duration::seconds(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].request.job_id, req.job_id);
        assert_eq!(batch[0].delivery_attempt, 1);
    }

    #[tokio::test]
    async fn acked_message_never_redelivers() {
        let (queue, clock) = queue_with_clock();
        queue.publish(request(Priority::Normal, None, 5)).await.unwrap();

        let batch = queue.pull("w1", 1, Duration::seconds(1)).await.unwrap();
        queue.ack(&batch[0].lease).await.unwrap();

        clock.advance(Duration::seconds(60));
        let batch = queue.pull("w1", 10, Duration::seconds(1)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn expired_lease_redelivers_to_another_subscriber() {
        let (queue, clock) = queue_with_clock();
        let req = request(Priority::Normal, None, 5);
        queue.publish(req.clone()).await.unwrap();

        let first = queue.pull("w1", 1, Duration::seconds(30)).await.unwrap();
        assert_eq!(first.len(), 1);

        // Before the deadline nothing redelivers.
        clock.advance(Duration::seconds(10));
        assert!(queue.pull("w2", 10, Duration::seconds(30)).await.unwrap().is_empty());

        clock.advance(Duration::seconds(30));
        let second = queue.pull("w2", 10, Duration::seconds(30)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].request.job_id, req.job_id);
        assert_eq!(second[0].delivery_attempt, 2);

        // The first worker's stale lease can no longer ack.
        assert!(queue.ack(&first[0].lease).await.is_err());
    }

    #[tokio::test]
    async fn nack_applies_backoff_with_bounded_jitter() {
        let (queue, clock) = queue_with_clock();
        queue.publish(request(Priority::Normal, None, 5)).await.unwrap();

        let batch = queue.pull("w1", 1, Duration::seconds(30)).await.unwrap();
        queue
            .nack(&batch[0].lease, Duration::seconds(10))
            .await
            .unwrap();

        // Below the -20% jitter floor: not yet deliverable.
        clock.advance(Duration::milliseconds(7_900));
        assert!(queue.pull("w1", 10, Duration::seconds(30)).await.unwrap().is_empty());

        // Past the +20% jitter ceiling: must be deliverable.
        clock.advance(Duration::milliseconds(4_200));
        let batch = queue.pull("w1", 10, Duration::seconds(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].delivery_attempt, 2);
    }

    #[tokio::test]
    async fn exhausted_message_routes_to_dlq_exactly_once() {
        let (queue, clock) = queue_with_clock();
        let req = request(Priority::Normal, None, 2);
        let job_id = req.job_id;
        queue.publish(req).await.unwrap();

        for _ in 0..2 {
            clock.advance(Duration::seconds(5));
            let batch = queue.pull("w1", 1, Duration::seconds(30)).await.unwrap();
            assert_eq!(batch.len(), 1);
            queue
                .nack(&batch[0].lease, Duration::milliseconds(10))
                .await
                .unwrap();
            clock.advance(Duration::seconds(1));
        }

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dlq_depth, 1);
        assert_eq!(stats.ready, 0);
        assert_eq!(queue.dlq_jobs().await.unwrap(), vec![job_id]);

        // Nothing more to deliver.
        clock.advance(Duration::seconds(60));
        assert!(queue.pull("w1", 10, Duration::seconds(30)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redrive_returns_message_to_main_queue() {
        let (queue, clock) = queue_with_clock();
        let req = request(Priority::Normal, None, 1);
        let job_id = req.job_id;
        queue.publish(req).await.unwrap();

        let batch = queue.pull("w1", 1, Duration::seconds(30)).await.unwrap();
        queue
            .nack(&batch[0].lease, Duration::milliseconds(10))
            .await
            .unwrap();
        assert_eq!(queue.stats().await.unwrap().dlq_depth, 1);

        let redriven = queue.redrive(&[job_id]).await.unwrap();
        assert_eq!(redriven, vec![job_id]);
        assert_eq!(queue.stats().await.unwrap().dlq_depth, 0);

        clock.advance(Duration::seconds(1));
        let batch = queue.pull("w1", 1, Duration::seconds(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        // Redrive resets the delivery budget.
        assert_eq!(batch[0].delivery_attempt, 1);
    }

    #[tokio::test]
    async fn ordering_key_serializes_delivery() {
        let (queue, clock) = queue_with_clock();
        let first = request(Priority::Normal, Some("K"), 5);
        let second = request(Priority::High, Some("K"), 5);
        queue.publish(first.clone()).await.unwrap();
        queue.publish(second.clone()).await.unwrap();

        // Even with higher priority, the later message is gated.
        let batch = queue.pull("w1", 10, Duration::seconds(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].request.job_id, first.job_id);

        // Still gated while the first is in flight.
        assert!(queue.pull("w2", 10, Duration::seconds(30)).await.unwrap().is_empty());

        queue.ack(&batch[0].lease).await.unwrap();
        clock.advance(Duration::seconds(1));
        let batch = queue.pull("w2", 10, Duration::seconds(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].request.job_id, second.job_id);
    }

    #[tokio::test]
    async fn nacked_head_still_blocks_its_key() {
        let (queue, clock) = queue_with_clock();
        let first = request(Priority::Normal, Some("K"), 5);
        let second = request(Priority::Normal, Some("K"), 5);
        queue.publish(first.clone()).await.unwrap();
        queue.publish(second).await.unwrap();

        let batch = queue.pull("w1", 1, Duration::seconds(30)).await.unwrap();
        queue
            .nack(&batch[0].lease, Duration::seconds(10))
            .await
            .unwrap();

        // The head is backing off, but the second message must not jump it.
        clock.advance(Duration::seconds(1));
        assert!(queue.pull("w1", 10, Duration::seconds(30)).await.unwrap().is_empty());

        clock.advance(Duration::seconds(12));
        let batch = queue.pull("w1", 10, Duration::seconds(30)).await.unwrap();
        assert_eq!(batch[0].request.job_id, first.job_id);
    }

    #[tokio::test]
    async fn unrelated_keys_deliver_concurrently() {
        let (queue, _clock) = queue_with_clock();
        queue.publish(request(Priority::Normal, Some("A"), 5)).await.unwrap();
        queue.publish(request(Priority::Normal, Some("B"), 5)).await.unwrap();
        queue.publish(request(Priority::Normal, None, 5)).await.unwrap();

        let batch = queue.pull("w1", 10, Duration::seconds(30)).await.unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn high_priority_pulled_ahead_of_low() {
        let (queue, _clock) = queue_with_clock();
        let low = request(Priority::Low, None, 5);
        let high = request(Priority::High, None, 5);
        queue.publish(low.clone()).await.unwrap();
        queue.publish(high.clone()).await.unwrap();

        let batch = queue.pull("w1", 1, Duration::seconds(30)).await.unwrap();
        assert_eq!(batch[0].request.job_id, high.job_id);
    }

    #[tokio::test]
    async fn stale_low_priority_is_promoted() {
        let (queue, clock) = queue_with_clock();
        let mut low = request(Priority::Low, None, 5);
        low.enqueued_at = clock.now();
        queue.publish(low.clone()).await.unwrap();

        clock.advance(Duration::minutes(11));
        let mut high = request(Priority::High, None, 5);
        high.enqueued_at = clock.now();
        queue.publish(high).await.unwrap();

        // The low message is older than the promotion threshold, so it wins
        // the within-band tie by sequence number.
        let batch = queue.pull("w1", 1, Duration::seconds(30)).await.unwrap();
        assert_eq!(batch[0].request.job_id, low.job_id);
    }

    #[tokio::test]
    async fn publish_backpressure_engages_and_releases() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = MemoryQueue::new(
            JobKind::Scrape,
            clock.clone(),
            QueueLimits {
                high_water: 3,
                low_water: 1,
            },
        );

        for _ in 0..3 {
            queue.publish(request(Priority::Normal, None, 5)).await.unwrap();
        }
        // At the high-water mark the queue pauses publishers.
        assert!(matches!(
            queue.publish(request(Priority::Normal, None, 5)).await,
            Err(Error::Unavailable(_))
        ));

        // Draining to the low-water mark resumes publishing.
        let batch = queue.pull("w1", 2, Duration::seconds(30)).await.unwrap();
        for delivery in &batch {
            queue.ack(&delivery.lease).await.unwrap();
        }
        queue.publish(request(Priority::Normal, None, 5)).await.unwrap();
    }

    #[tokio::test]
    async fn purge_removes_undelivered_messages() {
        let (queue, _clock) = queue_with_clock();
        let req = request(Priority::Normal, None, 5);
        let job_id = req.job_id;
        queue.publish(req).await.unwrap();
        queue.publish(request(Priority::Normal, None, 5)).await.unwrap();

        assert_eq!(queue.purge_job(job_id).await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn extend_pushes_deadline_out() {
        let (queue, clock) = queue_with_clock();
        queue.publish(request(Priority::Normal, None, 5)).await.unwrap();

        let batch = queue.pull("w1", 1, Duration::seconds(10)).await.unwrap();
        clock.advance(Duration::seconds(8));
        queue
            .extend(&batch[0].lease, Duration::seconds(10))
            .await
            .unwrap();

        // Past the original deadline, the lease still holds.
        clock.advance(Duration::seconds(5));
        assert!(queue.pull("w2", 10, Duration::seconds(10)).await.unwrap().is_empty());
        queue.ack(&batch[0].lease).await.unwrap();
    }
}
