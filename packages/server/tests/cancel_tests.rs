//! Cancellation promptness for queued and in-flight executions.

mod common;

use std::time::Duration;

use server_core::bus::MessageBus;
use server_core::domains::executions::{ExecutionState, Outcome};
use server_core::domains::jobs::JobStatus;
use server_core::kernel::test_dependencies::ScriptedScraper;

use common::{scrape_draft, EngineBuilder, TestEngine};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn cancel_in_flight_execution_stops_promptly() {
    // A long-running collaborator; cancellation must interrupt it.
    let engine =
        TestEngine::start(ScriptedScraper::always_ok().with_delay(Duration::from_secs(30))).await;

    let job = engine.submit(scrape_draft("http://example.test/slow")).await;
    engine
        .wait_execution_state(job.id, ExecutionState::Running, WAIT)
        .await;

    let cancelled_at = std::time::Instant::now();
    engine.intake.cancel(&engine.principal(), job.id).await.unwrap();

    let execution = engine
        .wait_execution_state(job.id, ExecutionState::Cancelled, WAIT)
        .await;
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(10),
        "in-flight cancellation exceeded its bound"
    );
    assert_eq!(execution.outcome, Some(Outcome::Cancelled));

    assert_eq!(engine.job(job.id).await.status, JobStatus::Cancelled);

    // No later attempts.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.executions(job.id).await.len(), 1);
    assert_eq!(engine.scraper.call_count(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn cancel_queued_execution_without_workers() {
    // No workers: the execution stays queued until cancelled.
    let engine = EngineBuilder::new(ScriptedScraper::always_ok())
        .without_workers()
        .start()
        .await;

    let job = engine.submit(scrape_draft("http://example.test/queued")).await;
    engine
        .wait_execution_state(job.id, ExecutionState::Queued, WAIT)
        .await;

    engine.intake.cancel(&engine.principal(), job.id).await.unwrap();

    let execution = engine
        .wait_execution_state(job.id, ExecutionState::Cancelled, WAIT)
        .await;
    assert_eq!(execution.outcome, Some(Outcome::Cancelled));
    assert_eq!(engine.job(job.id).await.status, JobStatus::Cancelled);

    // The queue message was purged.
    let stats = engine.bus.queue(job.kind).stats().await.unwrap();
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.inflight, 0);

    engine.stop().await;
}

#[tokio::test]
async fn cancelling_twice_is_idempotent() {
    let engine =
        TestEngine::start(ScriptedScraper::always_ok().with_delay(Duration::from_secs(5))).await;

    let job = engine.submit(scrape_draft("http://example.test/twice")).await;
    engine.intake.cancel(&engine.principal(), job.id).await.unwrap();
    engine.intake.cancel(&engine.principal(), job.id).await.unwrap();

    assert_eq!(engine.job(job.id).await.status, JobStatus::Cancelled);
    engine.stop().await;
}
