//! Serialized execution within an ordering key.

mod common;

use std::time::Duration;

use server_core::domains::executions::ExecutionState;
use server_core::kernel::test_dependencies::ScriptedScraper;

use common::{scrape_draft, TestEngine};

const WAIT: Duration = Duration::from_secs(15);

#[tokio::test]
async fn same_key_jobs_run_in_order_without_overlap() {
    let delay = Duration::from_millis(300);
    let engine = TestEngine::start(ScriptedScraper::always_ok().with_delay(delay)).await;

    let urls = [
        "http://example.test/k/1",
        "http://example.test/k/2",
        "http://example.test/k/3",
    ];
    let started = std::time::Instant::now();
    let mut jobs = Vec::new();
    for url in urls {
        let mut draft = scrape_draft(url);
        draft.ordering_key = Some("K".into());
        jobs.push(engine.submit(draft).await);
    }

    for job in &jobs {
        engine
            .wait_execution_state(job.id, ExecutionState::Succeeded, WAIT)
            .await;
    }
    let elapsed = started.elapsed();

    // Three serialized 300ms runs cannot finish faster than their sum.
    assert!(
        elapsed >= Duration::from_millis(900),
        "serialized jobs completed too fast: {elapsed:?}"
    );

    let spans = engine.scraper.run_spans();
    assert_eq!(spans.len(), 3);

    // Started in submission order.
    let observed: Vec<&str> = spans.iter().map(|s| s.source.as_str()).collect();
    assert_eq!(observed, urls.to_vec());

    // No overlap: each run finished before the next began.
    for pair in spans.windows(2) {
        assert!(
            pair[0].finished <= pair[1].started,
            "executions overlapped within ordering key"
        );
    }

    engine.stop().await;
}

#[tokio::test]
async fn distinct_keys_run_concurrently() {
    let delay = Duration::from_millis(300);
    let engine = TestEngine::start(ScriptedScraper::always_ok().with_delay(delay)).await;

    let started = std::time::Instant::now();
    let mut jobs = Vec::new();
    for (i, key) in ["A", "B", "C"].iter().enumerate() {
        let mut draft = scrape_draft(&format!("http://example.test/{key}/{i}"));
        draft.ordering_key = Some((*key).into());
        jobs.push(engine.submit(draft).await);
    }

    for job in &jobs {
        engine
            .wait_execution_state(job.id, ExecutionState::Succeeded, WAIT)
            .await;
    }

    // With four slots and unrelated keys, the three 300ms runs overlap;
    // well under the serialized 900ms (margin for scheduling noise).
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(800),
        "independent jobs appear serialized: {elapsed:?}"
    );

    engine.stop().await;
}
