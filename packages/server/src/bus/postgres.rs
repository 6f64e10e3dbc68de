//! PostgreSQL-backed dispatch queue.
//!
//! Messages live in the `dispatch_messages` table; claiming uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never double-deliver.
//! Ordering keys are enforced by a gate subquery: a message is claimable
//! only when nothing earlier in its key is still leased or waiting.
//! Expired leases are reaped lazily at the start of every pull.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::common::error::{Error, Result};
use crate::common::{JobId, JobKind};

use super::memory::QueueLimits;
use super::{
    jittered, starvation_promotion_after, Delivery, DispatchQueue, DlqObserver, ExecutionRequest,
    LeaseToken, MessageBus, QueueStats,
};

pub struct PostgresQueue {
    pool: PgPool,
    kind: JobKind,
    limits: QueueLimits,
    paused: AtomicBool,
    observer: Mutex<Option<Arc<dyn DlqObserver>>>,
}

struct DlqTransfer {
    request: ExecutionRequest,
    delivery_attempts: i32,
    last_error: Option<String>,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, kind: JobKind, limits: QueueLimits) -> Self {
        Self {
            pool,
            kind,
            limits,
            paused: AtomicBool::new(false),
            observer: Mutex::new(None),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn DlqObserver>) {
        *self.observer.lock().expect("observer lock poisoned") = Some(observer);
    }

    fn backend_err(e: sqlx::Error) -> Error {
        Error::RetryableBackend(format!("postgres queue: {e}"))
    }

    fn decode_request(row: &PgRow) -> Result<ExecutionRequest> {
        let payload: serde_json::Value = row.get("payload");
        serde_json::from_value(payload)
            .map_err(|e| Error::Internal(anyhow::anyhow!("corrupt queue payload: {e}")))
    }

    async fn notify_dead_letters(&self, transfers: Vec<DlqTransfer>) {
        if transfers.is_empty() {
            return;
        }
        let observer = self.observer.lock().expect("observer lock poisoned").clone();
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

    /// Return expired leases to ready and dead-letter the ones whose
    /// delivery budget is spent.
    async fn reap_expired(&self) -> Result<Vec<DlqTransfer>> {
        sqlx::query(
            r#"
            UPDATE dispatch_messages
            SET status = 'ready', lease_token = NULL, subscriber_id = NULL,
                lease_expires_at = NULL, last_error = 'lease expired',
                available_at = NOW()
            WHERE queue = $1 AND status = 'leased' AND lease_expires_at < NOW()
              AND delivery_attempts < max_attempts
            "#,
        )
        .bind(self.kind.as_str())
        .execute(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        let rows = sqlx::query(
            r#"
            UPDATE dispatch_messages
            SET status = 'dead_lettered', lease_token = NULL, subscriber_id = NULL,
                lease_expires_at = NULL, last_error = 'lease expired'
            WHERE queue = $1 AND status = 'leased' AND lease_expires_at < NOW()
              AND delivery_attempts >= max_attempts
            RETURNING payload, delivery_attempts, last_error
            "#,
        )
        .bind(self.kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        rows.iter()
            .map(|row| {
                Ok(DlqTransfer {
                    request: Self::decode_request(row)?,
                    delivery_attempts: row.get("delivery_attempts"),
                    last_error: row.get("last_error"),
                })
            })
            .collect()
    }

    /// Claim up to `limit` messages from one priority band. Band 0 also
    /// contains low-priority messages past the starvation threshold.
    async fn claim_band(
        &self,
        subscriber_id: &str,
        band: i16,
        limit: i64,
        ack_deadline: Duration,
    ) -> Result<Vec<Delivery>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let promotion_cutoff = Utc::now() - starvation_promotion_after();

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM dispatch_messages m
                WHERE m.queue = $1
                  AND m.status = 'ready'
                  AND m.available_at <= NOW()
                  AND (CASE
                         WHEN m.priority = 2 AND m.enqueued_at <= $2 THEN 0
                         ELSE m.priority
                       END) = $3
                  AND (m.ordering_key IS NULL OR NOT EXISTS (
                        SELECT 1 FROM dispatch_messages b
                        WHERE b.queue = m.queue
                          AND b.ordering_key = m.ordering_key
                          AND b.status <> 'dead_lettered'
                          AND (b.status = 'leased' OR b.published_seq < m.published_seq)
                  ))
                ORDER BY m.published_seq
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE dispatch_messages
            SET status = 'leased',
                delivery_attempts = delivery_attempts + 1,
                subscriber_id = $5,
                lease_token = gen_random_uuid(),
                lease_expires_at = NOW() + ($6 || ' milliseconds')::INTERVAL
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, payload, delivery_attempts, lease_token, lease_expires_at
            "#,
        )
        .bind(self.kind.as_str())
        .bind(promotion_cutoff)
        .bind(band)
        .bind(limit)
        .bind(subscriber_id)
        .bind(ack_deadline.num_milliseconds().to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        rows.iter()
            .map(|row| {
                Ok(Delivery {
                    lease: LeaseToken {
                        message_id: row.get("id"),
                        token: row.get("lease_token"),
                    },
                    request: Self::decode_request(row)?,
                    delivery_attempt: row.get("delivery_attempts"),
                    ack_deadline: row.get("lease_expires_at"),
                })
            })
            .collect()
    }

    async fn outstanding(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM dispatch_messages WHERE queue = $1 AND status <> 'dead_lettered'",
        )
        .bind(self.kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(Self::backend_err)?;
        Ok(row.get("total"))
    }
}

#[async_trait]
impl DispatchQueue for PostgresQueue {
    async fn publish(&self, request: ExecutionRequest) -> Result<()> {
        let outstanding = self.outstanding().await? as usize;
        if self.paused.load(Ordering::Acquire) {
            if outstanding > self.limits.low_water {
                return Err(Error::Unavailable(format!("queue {} full", self.kind)));
            }
            self.paused.store(false, Ordering::Release);
        } else if outstanding >= self.limits.high_water {
            self.paused.store(true, Ordering::Release);
            return Err(Error::Unavailable(format!("queue {} full", self.kind)));
        }

        sqlx::query(
            r#"
            INSERT INTO dispatch_messages (
                id, queue, job_id, payload, ordering_key, priority,
                status, delivery_attempts, max_attempts, available_at, enqueued_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'ready', 0, $7, NOW(), $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(self.kind.as_str())
        .bind(request.job_id.into_uuid())
        .bind(serde_json::to_value(&request).map_err(|e| {
            Error::Internal(anyhow::anyhow!("queue payload serialization failed: {e}"))
        })?)
        .bind(&request.ordering_key)
        .bind(request.priority.rank())
        .bind(request.retry.max_attempts)
        .bind(request.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(Self::backend_err)?;
        Ok(())
    }

    async fn pull(
        &self,
        subscriber_id: &str,
        max_batch: usize,
        ack_deadline: Duration,
    ) -> Result<Vec<Delivery>> {
        let transfers = self.reap_expired().await?;
        self.notify_dead_letters(transfers).await;

        // Band quotas follow the 8:4:1 weights; leftovers fill from the
        // highest band down.
        let batch = max_batch as i64;
        let quotas = [
            (0i16, (batch * 8 + 12) / 13),
            (1i16, (batch * 4 + 12) / 13),
            (2i16, (batch + 12) / 13),
        ];

        let mut deliveries = Vec::new();
        for (band, quota) in quotas {
            let remaining = batch - deliveries.len() as i64;
            let mut claimed = self
                .claim_band(subscriber_id, band, quota.min(remaining), ack_deadline)
                .await?;
            deliveries.append(&mut claimed);
        }
        for band in [0i16, 1, 2] {
            let remaining = batch - deliveries.len() as i64;
            if remaining <= 0 {
                break;
            }
            let mut claimed = self
                .claim_band(subscriber_id, band, remaining, ack_deadline)
                .await?;
            deliveries.append(&mut claimed);
        }
        Ok(deliveries)
    }

    async fn ack(&self, lease: &LeaseToken) -> Result<()> {
        let deleted = sqlx::query(
            "DELETE FROM dispatch_messages WHERE id = $1 AND lease_token = $2 AND status = 'leased'",
        )
        .bind(lease.message_id)
        .bind(lease.token)
        .execute(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        if deleted.rows_affected() == 0 {
            return Err(Error::Conflict("lease expired or message gone".into()));
        }
        Ok(())
    }

    async fn nack(&self, lease: &LeaseToken, requeue_delay: Duration) -> Result<()> {
        // Exhausted messages transfer to the DLQ; the rest back off.
        let rows = sqlx::query(
            r#"
            UPDATE dispatch_messages
            SET status = 'dead_lettered', lease_token = NULL, subscriber_id = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND lease_token = $2 AND status = 'leased'
              AND delivery_attempts >= max_attempts
            RETURNING payload, delivery_attempts, last_error
            "#,
        )
        .bind(lease.message_id)
        .bind(lease.token)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        if let Some(row) = rows.first() {
            let transfer = DlqTransfer {
                request: Self::decode_request(row)?,
                delivery_attempts: row.get("delivery_attempts"),
                last_error: row.get("last_error"),
            };
            self.notify_dead_letters(vec![transfer]).await;
            return Ok(());
        }

        let delay_ms = jittered(requeue_delay).num_milliseconds().max(0);
        let requeued = sqlx::query(
            r#"
            UPDATE dispatch_messages
            SET status = 'ready', lease_token = NULL, subscriber_id = NULL,
                lease_expires_at = NULL,
                available_at = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id = $1 AND lease_token = $2 AND status = 'leased'
            "#,
        )
        .bind(lease.message_id)
        .bind(lease.token)
        .bind(delay_ms.to_string())
        .execute(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        if requeued.rows_affected() == 0 {
            return Err(Error::Conflict("lease expired or message gone".into()));
        }
        Ok(())
    }

    async fn extend(&self, lease: &LeaseToken, additional: Duration) -> Result<()> {
        let extended = sqlx::query(
            r#"
            UPDATE dispatch_messages
            SET lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id = $1 AND lease_token = $2 AND status = 'leased'
            "#,
        )
        .bind(lease.message_id)
        .bind(lease.token)
        .bind(additional.num_milliseconds().to_string())
        .execute(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        if extended.rows_affected() == 0 {
            return Err(Error::Conflict("lease expired or message gone".into()));
        }
        Ok(())
    }

    async fn purge_job(&self, job_id: JobId) -> Result<usize> {
        let deleted = sqlx::query(
            "DELETE FROM dispatch_messages WHERE queue = $1 AND job_id = $2 AND status = 'ready'",
        )
        .bind(self.kind.as_str())
        .bind(job_id.into_uuid())
        .execute(&self.pool)
        .await
        .map_err(Self::backend_err)?;
        Ok(deleted.rows_affected() as usize)
    }

    async fn redrive(&self, job_ids: &[JobId]) -> Result<Vec<JobId>> {
        let ids: Vec<Uuid> = job_ids.iter().map(|id| id.into_uuid()).collect();
        let rows = sqlx::query(
            r#"
            UPDATE dispatch_messages
            SET status = 'ready', delivery_attempts = 0, last_error = NULL,
                available_at = NOW()
            WHERE queue = $1 AND status = 'dead_lettered' AND job_id = ANY($2)
            RETURNING job_id
            "#,
        )
        .bind(self.kind.as_str())
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        let mut redriven: Vec<JobId> = Vec::new();
        for row in rows {
            let job_id = JobId::from_uuid(row.get("job_id"));
            if !redriven.contains(&job_id) {
                redriven.push(job_id);
            }
        }
        Ok(redriven)
    }

    async fn dlq_jobs(&self) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (job_id) job_id, published_seq
            FROM dispatch_messages
            WHERE queue = $1 AND status = 'dead_lettered'
            ORDER BY job_id, published_seq
            "#,
        )
        .bind(self.kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        Ok(rows
            .iter()
            .map(|row| JobId::from_uuid(row.get("job_id")))
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'ready') AS ready,
                COUNT(*) FILTER (WHERE status = 'leased') AS inflight,
                COUNT(*) FILTER (WHERE status = 'dead_lettered') AS dlq
            FROM dispatch_messages
            WHERE queue = $1
            "#,
        )
        .bind(self.kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        Ok(QueueStats {
            ready: row.get::<i64, _>("ready") as usize,
            inflight: row.get::<i64, _>("inflight") as usize,
            dlq_depth: row.get::<i64, _>("dlq") as usize,
        })
    }
}

/// One Postgres-backed queue per job kind, sharing a pool.
pub struct PostgresBus {
    queues: HashMap<JobKind, Arc<PostgresQueue>>,
}

impl PostgresBus {
    pub fn new(pool: PgPool, limits: QueueLimits) -> Self {
        let queues = JobKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(PostgresQueue::new(pool.clone(), kind, limits))))
            .collect();
        Self { queues }
    }
}

impl MessageBus for PostgresBus {
    fn queue(&self, kind: JobKind) -> Arc<dyn DispatchQueue> {
        self.queues.get(&kind).expect("queue exists for kind").clone()
    }

    fn set_observer(&self, observer: Arc<dyn DlqObserver>) {
        for queue in self.queues.values() {
            queue.set_observer(observer.clone());
        }
    }
}
