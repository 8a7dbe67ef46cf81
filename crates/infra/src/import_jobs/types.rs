//! Import watermarks.

use serde::{Deserialize, Serialize};

/// How far a job has enqueued, and how far the upstream is known to go.
///
/// `source_max = None` means the upstream size is unknown or not tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJobQueueStatus {
    pub enqueued_max: u64,
    pub source_max: Option<u64>,
}

impl ImportJobQueueStatus {
    pub fn new(enqueued_max: u64, source_max: Option<u64>) -> Self {
        Self {
            enqueued_max,
            source_max,
        }
    }

    /// Component-wise max; a `None` source never lowers a known one.
    pub fn merge(self, other: Self) -> Self {
        Self {
            enqueued_max: self.enqueued_max.max(other.enqueued_max),
            source_max: match (self.source_max, other.source_max) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

/// How far consumers have processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJobProcessingStatus {
    pub processed_max: u64,
}

impl ImportJobProcessingStatus {
    pub fn new(processed_max: u64) -> Self {
        Self { processed_max }
    }
}

/// Watermarks of one import job.
///
/// The all-zero value doubles as "never tracked": an untracked job and one
/// explicitly written as zero read back the same.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJobStatus {
    pub queue: ImportJobQueueStatus,
    pub processing: ImportJobProcessingStatus,
}

impl ImportJobStatus {
    pub fn enqueued_max(&self) -> u64 {
        self.queue.enqueued_max
    }

    pub fn source_max(&self) -> Option<u64> {
        self.queue.source_max
    }

    pub fn processed_max(&self) -> u64 {
        self.processing.processed_max
    }

    /// Items handed to the bus but not yet processed.
    pub fn unprocessed(&self) -> u64 {
        self.queue
            .enqueued_max
            .saturating_sub(self.processing.processed_max)
    }

    /// Everything enqueued has been processed.
    pub fn is_caught_up(&self) -> bool {
        self.processing.processed_max == self.queue.enqueued_max
    }
}
