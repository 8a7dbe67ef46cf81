//! Incremental imports: the backpressure-aware enqueue loop, its per-item
//! state, and the A2 user import built on it.

pub mod a2_users;
pub mod importer;
pub mod items;
pub mod processed;
pub mod source;

pub use a2_users::{
    A2_USER_ID_IMPORT_JOB, A2UserDirectory, A2UserIdImportJob, A2UserIdImporter, A2UserIdPage, A2UserIdSource,
    InMemoryA2UserDirectory, a2_user_id_import_job_id, a2_user_id_import_registration,
};
pub use importer::{ImportDependencies, ImportRunSummary, IncrementalImporter, StopReason};
pub use items::{ImportItemStore, ImportItemStoreError, InMemoryImportItemStore, PostgresImportItemStore};
pub use processed::{A2PartySink, A2UserPartyHandler, ProcessedWatermarkReporter};
pub use source::{ImportError, ImportSource, UpstreamPage};
