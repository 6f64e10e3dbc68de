//! Read-only views over jobs, executions, and artifacts.

mod service;

pub use service::{JobFilter, QueryService, StatusReport};
