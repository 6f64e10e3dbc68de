//! Scripted collaborator fakes for tests.
//!
//! Deterministic stand-ins for the clock, the scraper, and the OCR engine
//! so lifecycle behavior can be exercised without network or wall-clock
//! dependencies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::common::error::Result;
use crate::domains::artifacts::ArtifactMetadata;
use crate::domains::jobs::{OcrParams, ScrapeParams};

use super::{ArtifactPayload, Clock, CollabContext, CollaboratorOutput, OcrEngine, Scraper};

// ============================================================================
// Clock
// ============================================================================

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("clock lock poisoned") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

// ============================================================================
// Scripted collaborators
// ============================================================================

/// Start/finish window of one collaborator run, for overlap assertions.
#[derive(Debug, Clone)]
pub struct RunSpan {
    pub source: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Clone)]
enum PlannedResult {
    Retryable(String),
    Terminal(String),
}

/// A scraper that follows a scripted sequence of outcomes.
///
/// Once the plan runs dry it falls back to `forever` (or success when no
/// fallback is set). Successful runs produce one markdown artifact whose
/// `metadata.source_url` is the requested URL.
pub struct ScriptedScraper {
    plan: Mutex<VecDeque<PlannedResult>>,
    forever: Option<PlannedResult>,
    delay: Duration,
    calls: AtomicUsize,
    runs: Mutex<Vec<RunSpan>>,
}

impl ScriptedScraper {
    pub fn always_ok() -> Self {
        Self::with_plan(Vec::new(), None)
    }

    /// Fail retryably `n` times, then succeed.
    pub fn fail_times(n: usize) -> Self {
        let plan = vec![PlannedResult::Retryable("scripted transient failure".into()); n];
        Self::with_plan(plan, None)
    }

    pub fn always_retryable() -> Self {
        Self::with_plan(
            Vec::new(),
            Some(PlannedResult::Retryable("scripted transient failure".into())),
        )
    }

    pub fn always_terminal() -> Self {
        Self::with_plan(
            Vec::new(),
            Some(PlannedResult::Terminal("scripted permanent failure".into())),
        )
    }

    fn with_plan(plan: Vec<PlannedResult>, forever: Option<PlannedResult>) -> Self {
        Self {
            plan: Mutex::new(plan.into()),
            forever,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Make every run take this long (cancellation-aware sleep).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn run_spans(&self) -> Vec<RunSpan> {
        self.runs.lock().expect("runs lock poisoned").clone()
    }
}

#[async_trait]
impl Scraper for ScriptedScraper {
    async fn run(&self, params: &ScrapeParams, ctx: &CollabContext) -> Result<CollaboratorOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        if !self.delay.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        let planned = self
            .plan
            .lock()
            .expect("plan lock poisoned")
            .pop_front()
            .or_else(|| self.forever.clone());
        let output = match planned {
            Some(PlannedResult::Retryable(msg)) => CollaboratorOutput::retryable(msg),
            Some(PlannedResult::Terminal(msg)) => CollaboratorOutput::terminal(msg),
            None => CollaboratorOutput::ok(vec![ArtifactPayload {
                content_type: "text/markdown".into(),
                data: Bytes::from(format!("# scraped\n\n{}\n", params.url)),
                metadata: ArtifactMetadata {
                    source_url: Some(params.url.clone()),
                    title: Some("scraped page".into()),
                    ..Default::default()
                },
            }]),
        };

        self.runs.lock().expect("runs lock poisoned").push(RunSpan {
            source: params.url.clone(),
            started,
            finished: Instant::now(),
        });
        Ok(output)
    }
}

/// A scripted OCR engine; successful runs produce one plain-text artifact
/// with page metadata.
pub struct ScriptedOcr {
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedOcr {
    pub fn always_ok() -> Self {
        Self {
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    async fn process(
        &self,
        params: &OcrParams,
        ctx: &CollabContext,
    ) -> Result<CollaboratorOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Ok(CollaboratorOutput::retryable("ocr cancelled"));
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        Ok(CollaboratorOutput::ok(vec![ArtifactPayload {
            content_type: "text/plain".into(),
            data: Bytes::from_static(b"recognized text"),
            metadata: ArtifactMetadata {
                source_url: Some(params.document_url.clone()),
                page_count: Some(1),
                language: params.language.clone().or_else(|| Some("en".into())),
                ocr_confidence: Some(0.98),
                ..Default::default()
            },
        }]))
    }
}
