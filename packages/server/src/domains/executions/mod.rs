//! Execution lifecycle recording.

mod models;
mod recorder;

pub use models::{Execution, ExecutionState, Outcome};
pub use recorder::{Recorder, RecorderDlqObserver};
