//! Job intake and the JobSpec model.

mod intake;
mod models;
mod params;

pub use intake::{Intake, SubmitOutcome};
pub use models::{
    next_cron_occurrence, Job, JobDraft, JobStatus, Schedule, DEFAULT_TIMEOUT_MS,
};
pub use params::{OcrParams, Parameters, ScrapeParams, SCHEMA_VERSION};
