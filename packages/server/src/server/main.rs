// Main entry point for the task lifecycle engine server

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use server_core::blob::{BlobStore, FsBlobStore};
use server_core::bus::{InMemoryBus, MessageBus, PostgresBus, QueueLimits};
use server_core::common::JobKind;
use server_core::config::{Config, StoreBackend};
use server_core::domains::auth::{Governor, GovernorConfig, RateSync};
use server_core::domains::executions::{Recorder, RecorderDlqObserver};
use server_core::domains::jobs::Intake;
use server_core::domains::queries::QueryService;
use server_core::domains::scheduler::{LeaderLease, LeaseConfig, Scheduler, SchedulerConfig};
use server_core::domains::workers::{Handler, OcrHandler, ScrapeHandler, WorkerConfig, WorkerRuntime};
use server_core::kernel::maintenance::{start_maintenance, RetentionConfig};
use server_core::kernel::{
    Clock, DisabledOcrEngine, HttpOcrEngine, Kernel, OcrEngine, ServiceHost, SimpleScraper,
    StaticKeyValidator, SystemClock,
};
use server_core::server::{build_app, AppState};
use server_core::store::{MemoryMetadataStore, MetadataStore, PostgresMetadataStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting task lifecycle engine");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let limits = QueueLimits::default();

    let (store, bus): (Arc<dyn MetadataStore>, Arc<dyn MessageBus>) = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_ref()
                .context("DATABASE_URL must be set")?;
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Migrations complete");
            (
                Arc::new(PostgresMetadataStore::new(pool.clone())),
                Arc::new(PostgresBus::new(pool, limits)),
            )
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store and bus; state is lost on restart");
            (
                Arc::new(MemoryMetadataStore::new()),
                Arc::new(InMemoryBus::new(clock.clone(), limits)),
            )
        }
    };

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.blob_root.clone()));
    let scraper = Arc::new(SimpleScraper::new()?);
    let ocr: Arc<dyn OcrEngine> = match &config.ocr_endpoint {
        Some(endpoint) => Arc::new(HttpOcrEngine::new(
            endpoint.clone(),
            config.ocr_api_key.clone().unwrap_or_default(),
        )?),
        None => {
            tracing::warn!("OCR_ENDPOINT not set; OCR jobs will fail terminally");
            Arc::new(DisabledOcrEngine)
        }
    };

    let key_validator = match &config.api_keys {
        Some(spec) => StaticKeyValidator::from_spec(spec)
            .map_err(|e| anyhow::anyhow!("API_KEYS parse failed: {e}"))?,
        None => {
            tracing::warn!("API_KEYS not set; every request will be rejected");
            StaticKeyValidator::new()
        }
    };

    let kernel = Arc::new(Kernel::new(
        store.clone(),
        blobs.clone(),
        bus.clone(),
        scraper,
        ocr,
        clock.clone(),
        Arc::new(key_validator),
    ));

    let recorder = Arc::new(Recorder::new(store.clone(), clock.clone()));
    bus.set_observer(Arc::new(RecorderDlqObserver::new(recorder.clone())));

    let governor = Arc::new(Governor::new(
        kernel.key_validator.clone(),
        store.clone(),
        clock.clone(),
        GovernorConfig {
            burst: config.rate_burst,
            refill_per_sec: config.rate_refill_per_sec,
            ..Default::default()
        },
    ));

    let (scheduler_tx, scheduler_rx) = mpsc::channel(1_024);
    let intake = Arc::new(Intake::new(
        store.clone(),
        bus.clone(),
        recorder.clone(),
        scheduler_tx,
        clock.clone(),
    ));
    let queries = Arc::new(QueryService::new(store.clone(), blobs.clone(), bus.clone()));

    let scheduler = Scheduler::new(
        store.clone(),
        bus.clone(),
        recorder.clone(),
        clock.clone(),
        LeaderLease::new(
            store.clone(),
            clock.clone(),
            format!("scheduler-{}", Uuid::new_v4()),
            LeaseConfig::default(),
        ),
        scheduler_rx,
        SchedulerConfig::default(),
    );

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
        bus.clone(),
        blobs.clone(),
        recorder.clone(),
        clock.clone(),
        handlers,
        WorkerConfig {
            slots: config.worker_slots,
            ..Default::default()
        },
    )?;

    let mut maintenance = start_maintenance(store.clone(), blobs.clone(), RetentionConfig::default())
        .await
        .context("Failed to start maintenance scheduler")?;

    let host = ServiceHost::new()
        .with_service(scheduler)
        .with_service(workers)
        .with_service(RateSync::new(governor.clone()));
    let shutdown = host.shutdown_token();
    let host_task = tokio::spawn(host.run_until(shutdown.clone().cancelled_owned()));

    let app = build_app(AppState {
        kernel,
        governor,
        intake,
        queries,
        recorder,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("termination signal received");
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    host_task.await.context("Service host panicked")?;
    maintenance
        .shutdown()
        .await
        .context("Maintenance scheduler shutdown failed")?;

    tracing::info!("Shutdown complete");
    Ok(())
}
