//! Worker runtime and kind handlers.

mod handlers;
mod runtime;

pub use handlers::{Handler, OcrHandler, ScrapeHandler};
pub use runtime::{WorkerConfig, WorkerRuntime};
