//! Kind handlers: one per job kind, each wrapping its collaborator.

use async_trait::async_trait;
use std::sync::Arc;

use crate::common::error::Result;
use crate::common::JobKind;
use crate::domains::jobs::{Job, Parameters};
use crate::kernel::{CollabContext, CollaboratorOutput, OcrEngine, Scraper};

#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, job: &Job, ctx: &CollabContext) -> Result<CollaboratorOutput>;
}

pub struct ScrapeHandler {
    scraper: Arc<dyn Scraper>,
}

impl ScrapeHandler {
    pub fn new(scraper: Arc<dyn Scraper>) -> Self {
        Self { scraper }
    }
}

#[async_trait]
impl Handler for ScrapeHandler {
    async fn run(&self, job: &Job, ctx: &CollabContext) -> Result<CollaboratorOutput> {
        match &job.parameters {
            Parameters::Scrape(params) => self.scraper.run(params, ctx).await,
            Parameters::Ocr(_) => Ok(CollaboratorOutput::terminal(format!(
                "job {} routed to scrape handler with {} parameters",
                job.id,
                JobKind::Ocr
            ))),
        }
    }
}

pub struct OcrHandler {
    engine: Arc<dyn OcrEngine>,
}

impl OcrHandler {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Handler for OcrHandler {
    async fn run(&self, job: &Job, ctx: &CollabContext) -> Result<CollaboratorOutput> {
        match &job.parameters {
            Parameters::Ocr(params) => self.engine.process(params, ctx).await,
            Parameters::Scrape(_) => Ok(CollaboratorOutput::terminal(format!(
                "job {} routed to ocr handler with {} parameters",
                job.id,
                JobKind::Scrape
            ))),
        }
    }
}
