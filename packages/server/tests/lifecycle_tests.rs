//! End-to-end lifecycle scenarios over the memory backends.

mod common;

use std::time::Duration;

use futures::StreamExt;
use server_core::common::hash::sha256_hex;
use server_core::domains::executions::{ExecutionState, Outcome};
use server_core::domains::jobs::JobStatus;
use server_core::kernel::test_dependencies::ScriptedScraper;

use common::{fast_retry, scrape_draft, TestEngine};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn happy_scrape_produces_artifact() {
    let engine = TestEngine::start(ScriptedScraper::always_ok()).await;

    let job = engine.submit(scrape_draft("http://example.test/a")).await;
    let execution = engine
        .wait_execution_state(job.id, ExecutionState::Succeeded, WAIT)
        .await;

    assert_eq!(execution.attempt_number, 1);
    assert_eq!(execution.outcome, Some(Outcome::Success));
    assert_eq!(execution.produced_artifacts.len(), 1);

    let principal = engine.principal();
    let artifact = engine
        .queries
        .get_artifact(&principal, execution.produced_artifacts[0])
        .await
        .unwrap();
    assert_eq!(
        artifact.metadata.source_url.as_deref(),
        Some("http://example.test/a")
    );
    assert_eq!(artifact.content_type, "text/markdown");

    engine.wait_job_status(job.id, JobStatus::Completed, WAIT).await;
    engine.stop().await;
}

#[tokio::test]
async fn artifact_body_round_trips_with_matching_digest() {
    let engine = TestEngine::start(ScriptedScraper::always_ok()).await;

    let job = engine.submit(scrape_draft("http://example.test/digest")).await;
    let execution = engine
        .wait_execution_state(job.id, ExecutionState::Succeeded, WAIT)
        .await;

    let principal = engine.principal();
    let (artifact, mut stream) = engine
        .queries
        .stream_artifact_body(&principal, execution.produced_artifacts[0])
        .await
        .unwrap();

    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(sha256_hex(&body), artifact.sha256);
    assert_eq!(body.len() as i64, artifact.size_bytes);

    engine.stop().await;
}

#[tokio::test]
async fn retry_then_succeed_keeps_attempts_contiguous() {
    let engine = TestEngine::start(ScriptedScraper::fail_times(2)).await;

    let mut draft = scrape_draft("http://example.test/flaky");
    draft.retry_policy = fast_retry(5);
    let job = engine.submit(draft).await;

    engine
        .wait_execution_state(job.id, ExecutionState::Succeeded, WAIT)
        .await;

    let executions = engine.executions(job.id).await;
    assert_eq!(executions.len(), 3);

    let attempts: Vec<i32> = executions.iter().map(|e| e.attempt_number).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let outcomes: Vec<Option<Outcome>> = executions.iter().map(|e| e.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            Some(Outcome::RetryableFailure),
            Some(Outcome::RetryableFailure),
            Some(Outcome::Success),
        ]
    );

    engine.wait_job_status(job.id, JobStatus::Completed, WAIT).await;
    engine.stop().await;
}

#[tokio::test]
async fn terminal_failure_does_not_retry() {
    let engine = TestEngine::start(ScriptedScraper::always_terminal()).await;

    let job = engine.submit(scrape_draft("http://example.test/broken")).await;
    let execution = engine
        .wait_execution_state(job.id, ExecutionState::Failed, WAIT)
        .await;

    assert_eq!(execution.outcome, Some(Outcome::TerminalFailure));
    engine.wait_job_status(job.id, JobStatus::Failed, WAIT).await;

    // Settle and confirm no further attempts were made.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.executions(job.id).await.len(), 1);
    assert_eq!(engine.scraper.call_count(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn duplicate_submission_returns_same_job() {
    let engine = TestEngine::start(
        ScriptedScraper::always_ok().with_delay(Duration::from_millis(500)),
    )
    .await;
    let principal = engine.principal();

    let first = engine
        .intake
        .submit(&principal, scrape_draft("http://example.test/dup"))
        .await
        .unwrap();
    let second = engine
        .intake
        .submit(&principal, scrape_draft("http://example.test/dup"))
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.job.id, second.job.id);

    engine
        .wait_execution_state(first.job.id, ExecutionState::Succeeded, WAIT)
        .await;

    // Exactly one execution, ever.
    assert_eq!(engine.executions(first.job.id).await.len(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn artifacts_are_visible_before_success_is_observable() {
    let engine = TestEngine::start(ScriptedScraper::always_ok()).await;

    let job = engine.submit(scrape_draft("http://example.test/visible")).await;
    let execution = engine
        .wait_execution_state(job.id, ExecutionState::Succeeded, WAIT)
        .await;

    // The instant succeeded is observable, every reported artifact must
    // already resolve.
    let principal = engine.principal();
    for artifact_id in &execution.produced_artifacts {
        assert!(engine
            .queries
            .get_artifact(&principal, *artifact_id)
            .await
            .is_ok());
    }

    engine.stop().await;
}
