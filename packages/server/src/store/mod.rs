//! Document-oriented metadata store.
//!
//! Everything durable except blobs and queue messages lives here: jobs,
//! executions, artifacts, rate buckets, the scheduler lease, and the DLQ
//! index. The contract is deliberately narrow: point reads, compare-and-swap
//! writes keyed on a per-document version counter, indexed range queries
//! ordered by `(created_at, id)`, and small atomic transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::error::{Error, Result};

pub mod memory;
pub mod postgres;

pub use memory::MemoryMetadataStore;
pub use postgres::PostgresMetadataStore;

/// Maximum number of documents a single transaction may touch.
pub const MAX_TX_DOCS: usize = 25;

/// Collection names used by the engine.
pub mod collections {
    pub const JOBS: &str = "jobs";
    pub const EXECUTIONS: &str = "executions";
    pub const ARTIFACTS: &str = "artifacts";
    pub const RATE_BUCKETS: &str = "rate_buckets";
    pub const SCHEDULER_LEASE: &str = "scheduler_lease";
    pub const SCHEDULER_EVENTS: &str = "scheduler_events";
    pub const DLQ_INDEX: &str = "dlq_index";
    pub const JOB_DEDUPE: &str = "job_dedupe";
    pub const EXECUTION_ATTEMPTS: &str = "execution_attempts";
}

/// A stored document. `version` starts at 1 and increments on every
/// successful `put`; it is the CAS token for concurrent writers.
#[derive(Debug, Clone)]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub version: i64,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Deserialize the body into a typed value.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| {
            Error::Internal(anyhow::anyhow!(
                "corrupt document {}/{}: {e}",
                self.collection,
                self.id
            ))
        })
    }
}

/// Serialize a typed value into a document body.
pub fn encode_body<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::Internal(anyhow::anyhow!("document body serialization failed: {e}")))
}

/// An indexed range query. Results are always ordered by
/// `(created_at, id)` ascending; `after` resumes strictly past a cursor
/// position in that order.
#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    /// Equality filters on top-level body fields.
    pub eq: Vec<(String, serde_json::Value)>,
    /// Numeric `field <= bound` filter on a top-level body field
    /// (used for due-time scans over epoch-millisecond fields).
    pub lte_num: Option<(String, i64)>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub after: Option<(DateTime<Utc>, String)>,
    pub limit: i64,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            eq: Vec::new(),
            lte_num: None,
            created_after: None,
            created_before: None,
            after: None,
            limit: 100,
        }
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.eq.push((field.into(), value.into()));
        self
    }

    pub fn lte_num(mut self, field: impl Into<String>, bound: i64) -> Self {
        self.lte_num = Some((field.into(), bound));
        self
    }

    pub fn created_after(mut self, ts: DateTime<Utc>) -> Self {
        self.created_after = Some(ts);
        self
    }

    pub fn created_before(mut self, ts: DateTime<Utc>) -> Self {
        self.created_before = Some(ts);
        self
    }

    pub fn after(mut self, created_at: DateTime<Utc>, id: impl Into<String>) -> Self {
        self.after = Some((created_at, id.into()));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }
}

/// One operation inside an atomic transaction.
#[derive(Debug, Clone)]
pub enum TxOp {
    /// Insert a new document; fails the transaction with `Conflict` if the
    /// id already exists.
    Insert {
        collection: String,
        id: String,
        body: serde_json::Value,
    },
    /// Replace a document body iff its version matches.
    Put {
        collection: String,
        id: String,
        expected_version: i64,
        body: serde_json::Value,
    },
    /// Delete a document if present.
    Delete { collection: String, id: String },
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Insert a new document at version 1. `Conflict` if the id exists.
    async fn insert(&self, collection: &str, id: &str, body: serde_json::Value)
        -> Result<Document>;

    /// Compare-and-swap replace. `Conflict` if the document is missing or
    /// its version differs from `expected_version`.
    async fn put(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        body: serde_json::Value,
    ) -> Result<Document>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    async fn query(&self, query: Query) -> Result<Vec<Document>>;

    async fn count(&self, query: Query) -> Result<i64>;

    /// Apply up to [`MAX_TX_DOCS`] operations atomically: either every
    /// precondition holds and every op is applied, or nothing is.
    async fn transact(&self, ops: Vec<TxOp>) -> Result<()>;
}

/// Read-modify-write under the document's version counter.
///
/// `apply` mutates the decoded value and returns whether a write is wanted;
/// on a CAS conflict the document is re-read and `apply` re-run, up to a
/// small retry budget. Returns `None` when the document does not exist.
pub async fn modify<T, F>(
    store: &dyn MetadataStore,
    collection: &str,
    id: &str,
    mut apply: F,
) -> Result<Option<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(&mut T) -> Result<bool>,
{
    const MAX_CAS_RETRIES: usize = 5;
    for _ in 0..MAX_CAS_RETRIES {
        let Some(doc) = store.get(collection, id).await? else {
            return Ok(None);
        };
        let mut value: T = doc.body_as()?;
        if !apply(&mut value)? {
            return Ok(Some(value));
        }
        match store.put(collection, id, doc.version, encode_body(&value)?).await {
            Ok(_) => return Ok(Some(value)),
            Err(Error::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(format!(
        "too many concurrent writers on {collection}/{id}"
    )))
}

pub(crate) fn check_tx_size(ops: &[TxOp]) -> Result<()> {
    if ops.len() > MAX_TX_DOCS {
        return Err(Error::InvalidRequest(format!(
            "transaction touches {} documents, limit is {MAX_TX_DOCS}",
            ops.len()
        )));
    }
    Ok(())
}
