use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use registry_core::ImportJobId;
use registry_messaging::{BusError, CommandEnvelope};

use super::items::ImportItemStoreError;
use crate::import_jobs::ImportJobTrackerError;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("upstream source error: {0}")]
    Source(String),

    #[error("invalid upstream item at position {position}: {reason}")]
    InvalidItem { position: u64, reason: String },

    #[error(transparent)]
    Tracker(#[from] ImportJobTrackerError),

    #[error(transparent)]
    Items(#[from] ImportItemStoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// One page of upstream positions.
///
/// Positions are strictly increasing and all greater than the `after` the
/// page was fetched with. An empty page means the source is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamPage {
    pub positions: Vec<u64>,
    /// Highest position known to exist upstream, if the source can tell.
    pub source_max: Option<u64>,
}

/// Paginated upstream scan feeding an incremental import.
///
/// The watermark is the continuation point: the importer always asks for
/// positions after the last one it enqueued, so the source keeps no cursor.
#[async_trait]
pub trait ImportSource: Send + Sync {
    async fn fetch_page(&self, after: u64) -> Result<UpstreamPage, ImportError>;

    /// Bus command asking a consumer to import the item at `position`.
    fn command_for(
        &self,
        job_id: &ImportJobId,
        position: u64,
        enqueued_at: DateTime<Utc>,
    ) -> Result<CommandEnvelope<JsonValue>, ImportError>;
}
