//! Test harness: the full engine wired against memory backends and
//! scripted collaborators, with compressed timings.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::Router;
use chrono::Duration;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use server_core::blob::{BlobStore, MemoryBlobStore};
use server_core::bus::{InMemoryBus, MessageBus, QueueLimits};
use server_core::common::{JobId, JobKind, TenantId};
use server_core::domains::auth::{Governor, GovernorConfig, Principal, Role};
use server_core::domains::executions::{Execution, ExecutionState, Recorder, RecorderDlqObserver};
use server_core::domains::jobs::{Intake, Job, JobDraft, JobStatus};
use server_core::domains::queries::QueryService;
use server_core::domains::scheduler::{
    LeaderLease, LeaseConfig, Scheduler, SchedulerConfig, SchedulerEvent,
};
use server_core::domains::workers::{Handler, OcrHandler, ScrapeHandler, WorkerConfig, WorkerRuntime};
use server_core::kernel::test_dependencies::{ScriptedOcr, ScriptedScraper};
use server_core::kernel::{Clock, Kernel, KeyRecord, Service, StaticKeyValidator, SystemClock};
use server_core::server::{build_app, AppState};
use server_core::store::{MemoryMetadataStore, MetadataStore};

pub const DEV_KEY: &str = "test-dev-key";
pub const ADMIN_KEY: &str = "test-admin-key";
pub const ANALYST_KEY: &str = "test-analyst-key";

pub struct EngineBuilder {
    scraper: ScriptedScraper,
    ocr: ScriptedOcr,
    start_workers: bool,
    worker_config: WorkerConfig,
    governor_config: GovernorConfig,
}

impl EngineBuilder {
    pub fn new(scraper: ScriptedScraper) -> Self {
        Self {
            scraper,
            ocr: ScriptedOcr::always_ok(),
            start_workers: true,
            worker_config: WorkerConfig {
                worker_id: "test-worker".into(),
                slots: 4,
                ack_deadline: Duration::milliseconds(1_000),
                poll_interval: StdDuration::from_millis(10),
                drain_grace: StdDuration::from_secs(5),
                cancel_grace: StdDuration::from_secs(5),
                ..Default::default()
            },
            governor_config: GovernorConfig {
                burst: 10_000.0,
                refill_per_sec: 10_000.0,
                sync_interval: StdDuration::from_secs(3600),
            },
        }
    }

    pub fn ocr(mut self, ocr: ScriptedOcr) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn without_workers(mut self) -> Self {
        self.start_workers = false;
        self
    }

    pub fn governor(mut self, config: GovernorConfig) -> Self {
        self.governor_config = config;
        self
    }

    pub async fn start(self) -> TestEngine {
        let tenant = TenantId::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let bus = Arc::new(InMemoryBus::new(clock.clone(), QueueLimits::default()));
        let scraper = Arc::new(self.scraper);
        let ocr = Arc::new(self.ocr);

        let keys = StaticKeyValidator::new()
            .with_key(
                DEV_KEY,
                KeyRecord {
                    principal_id: "dev".into(),
                    tenant_id: tenant,
                    role: Role::Developer,
                    expires_at: None,
                },
            )
            .with_key(
                ADMIN_KEY,
                KeyRecord {
                    principal_id: "admin".into(),
                    tenant_id: tenant,
                    role: Role::Admin,
                    expires_at: None,
                },
            )
            .with_key(
                ANALYST_KEY,
                KeyRecord {
                    principal_id: "analyst".into(),
                    tenant_id: tenant,
                    role: Role::Analyst,
                    expires_at: None,
                },
            );

        let kernel = Arc::new(Kernel::new(
            store.clone(),
            blobs.clone() as Arc<dyn BlobStore>,
            bus.clone() as Arc<dyn MessageBus>,
            scraper.clone(),
            ocr.clone(),
            clock.clone(),
            Arc::new(keys),
        ));

        let recorder = Arc::new(Recorder::new(store.clone(), clock.clone()));
        bus.set_observer(Arc::new(RecorderDlqObserver::new(recorder.clone())));

        let governor = Arc::new(Governor::new(
            kernel.key_validator.clone(),
            store.clone(),
            clock.clone(),
            self.governor_config,
        ));

        let (scheduler_tx, scheduler_rx) = mpsc::channel::<SchedulerEvent>(256);
        let intake = Arc::new(Intake::new(
            store.clone(),
            bus.clone() as Arc<dyn MessageBus>,
            recorder.clone(),
            scheduler_tx,
            clock.clone(),
        ));
        let queries = Arc::new(QueryService::new(
            store.clone(),
            blobs.clone() as Arc<dyn BlobStore>,
            bus.clone() as Arc<dyn MessageBus>,
        ));

        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        let scheduler = Scheduler::new(
            store.clone(),
            bus.clone() as Arc<dyn MessageBus>,
            recorder.clone(),
            clock.clone(),
            LeaderLease::new(store.clone(), clock.clone(), "test-scheduler", LeaseConfig::default()),
            scheduler_rx,
            SchedulerConfig {
                tick: StdDuration::from_millis(25),
                sweep_every: StdDuration::from_millis(500),
                sweep_grace: Duration::milliseconds(250),
                ..Default::default()
            },
        );
        handles.push(spawn_service(Box::new(scheduler), shutdown.clone()));

        if self.start_workers {
            let handlers: HashMap<JobKind, Arc<dyn Handler>> = HashMap::from([
                (
                    JobKind::Scrape,
                    Arc::new(ScrapeHandler::new(kernel.scraper.clone())) as Arc<dyn Handler>,
                ),
                (
                    JobKind::Ocr,
                    Arc::new(OcrHandler::new(kernel.ocr.clone())) as Arc<dyn Handler>,
                ),
            ]);
            let workers = WorkerRuntime::new(
                store.clone(),
                bus.clone() as Arc<dyn MessageBus>,
                blobs.clone() as Arc<dyn BlobStore>,
                recorder.clone(),
                clock.clone(),
                handlers,
                self.worker_config,
            )
            .expect("worker budget fits");
            handles.push(spawn_service(Box::new(workers), shutdown.clone()));
        }

        TestEngine {
            tenant,
            store,
            blobs,
            bus,
            kernel,
            recorder,
            governor,
            intake,
            queries,
            scraper,
            ocr,
            shutdown,
            handles,
        }
    }
}

fn spawn_service(service: Box<dyn Service>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = service.run(shutdown).await {
            panic!("service failed: {e}");
        }
    })
}

pub struct TestEngine {
    pub tenant: TenantId,
    pub store: Arc<dyn MetadataStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub bus: Arc<InMemoryBus>,
    pub kernel: Arc<Kernel>,
    pub recorder: Arc<Recorder>,
    pub governor: Arc<Governor>,
    pub intake: Arc<Intake>,
    pub queries: Arc<QueryService>,
    pub scraper: Arc<ScriptedScraper>,
    pub ocr: Arc<ScriptedOcr>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl TestEngine {
    pub async fn start(scraper: ScriptedScraper) -> Self {
        EngineBuilder::new(scraper).start().await
    }

    pub fn principal(&self) -> Principal {
        Principal {
            id: "dev".into(),
            tenant_id: self.tenant,
            role: Role::Developer,
        }
    }

    pub fn app(&self) -> Router {
        build_app(AppState {
            kernel: self.kernel.clone(),
            governor: self.governor.clone(),
            intake: self.intake.clone(),
            queries: self.queries.clone(),
            recorder: self.recorder.clone(),
        })
    }

    pub async fn submit(&self, draft: JobDraft) -> Job {
        self.intake
            .submit(&self.principal(), draft)
            .await
            .expect("submit succeeds")
            .job
    }

    pub async fn job(&self, id: JobId) -> Job {
        Job::require(&self.store, id).await.expect("job exists")
    }

    pub async fn executions(&self, job_id: JobId) -> Vec<Execution> {
        Execution::list_for_job(&self.store, job_id)
            .await
            .expect("executions load")
    }

    /// Poll until the job reaches the expected status.
    pub async fn wait_job_status(&self, job_id: JobId, status: JobStatus, timeout: StdDuration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.job(job_id).await.status == status {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "job {job_id} did not reach {status:?} within {timeout:?}, currently {:?}",
                    self.job(job_id).await.status
                );
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
    }

    /// Poll until some execution of the job is in the given state.
    pub async fn wait_execution_state(
        &self,
        job_id: JobId,
        state: ExecutionState,
        timeout: StdDuration,
    ) -> Execution {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(execution) = self
                .executions(job_id)
                .await
                .into_iter()
                .find(|e| e.state == state)
            {
                return execution;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "job {job_id} never produced an execution in {state:?}; rows: {:?}",
                    self.executions(job_id)
                        .await
                        .iter()
                        .map(|e| (e.attempt_number, e.state))
                        .collect::<Vec<_>>()
                );
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

pub fn scrape_draft(url: &str) -> JobDraft {
    JobDraft::builder()
        .kind(JobKind::Scrape)
        .parameters(json!({"url": url}))
        .build()
}

pub fn fast_retry(max_attempts: i32) -> server_core::common::RetryPolicy {
    server_core::common::RetryPolicy {
        max_attempts,
        initial_backoff_ms: 20,
        multiplier: 1.5,
        max_backoff_ms: 100,
    }
}
