//! Artifact records produced by executions.

mod models;

pub use models::{Artifact, ArtifactMetadata};
