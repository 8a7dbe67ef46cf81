//! Import job watermarks: enqueued, known-at-source and processed high-water marks.

pub mod in_memory;
pub mod postgres;
pub mod tracker;
pub mod types;

pub use in_memory::InMemoryImportJobTracker;
pub use postgres::PostgresImportJobTracker;
pub use tracker::{ImportJobTracker, ImportJobTrackerError};
pub use types::{ImportJobProcessingStatus, ImportJobQueueStatus, ImportJobStatus};
