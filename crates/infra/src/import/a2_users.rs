//! Incremental import of A2 user ids into the party registry.
//!
//! A2 hands out user ids from a dense increasing sequence, so the id doubles
//! as the watermark position and the directory's "ids after X" listing is the
//! continuation point.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use registry_core::{DomainError, ImportJobId, LeaseId};
use registry_messaging::CommandEnvelope;
use registry_parties::{A2UserId, ImportA2UserParty};

use super::importer::{IncrementalImporter, StopReason};
use super::source::{ImportError, ImportSource, UpstreamPage};
use crate::config::IncrementalImportConfig;
use crate::jobs::{HostLifecycle, Job, JobEnabled, JobError, JobRegistration};

/// Job name, import job id and (prefixed) lease name of the A2 user import.
pub const A2_USER_ID_IMPORT_JOB: &str = "a2-user-id-import";

pub fn a2_user_id_import_job_id() -> Result<ImportJobId, DomainError> {
    ImportJobId::new(A2_USER_ID_IMPORT_JOB)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct A2UserIdPage {
    /// Ascending ids strictly after the requested one.
    pub user_ids: Vec<A2UserId>,
    pub highest_user_id: Option<A2UserId>,
}

/// Read access to the A2 user directory.
#[async_trait]
pub trait A2UserDirectory: Send + Sync {
    async fn list_user_ids(&self, after: Option<A2UserId>, limit: usize) -> Result<A2UserIdPage, ImportError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), ImportError> {
        Ok(())
    }
}

#[async_trait]
impl<T> A2UserDirectory for Arc<T>
where
    T: A2UserDirectory + ?Sized,
{
    async fn list_user_ids(&self, after: Option<A2UserId>, limit: usize) -> Result<A2UserIdPage, ImportError> {
        (**self).list_user_ids(after, limit).await
    }

    async fn ping(&self) -> Result<(), ImportError> {
        (**self).ping().await
    }
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryA2UserDirectory {
    users: Mutex<BTreeSet<A2UserId>>,
    unavailable: Mutex<bool>,
}

impl InMemoryA2UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding users `1..=count`.
    pub fn with_dense_users(count: u64) -> Self {
        let directory = Self::new();
        if let Ok(mut users) = directory.users.lock() {
            users.extend((1..=count).filter_map(|id| A2UserId::new(id).ok()));
        }
        directory
    }

    pub fn add_user(&self, id: A2UserId) {
        if let Ok(mut users) = self.users.lock() {
            users.insert(id);
        }
    }

    /// Make every call fail, as if the directory were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut flag) = self.unavailable.lock() {
            *flag = unavailable;
        }
    }

    fn check_available(&self) -> Result<(), ImportError> {
        let unavailable = self.unavailable.lock().map(|f| *f).unwrap_or(true);
        if unavailable {
            return Err(ImportError::Source("A2 directory unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl A2UserDirectory for InMemoryA2UserDirectory {
    async fn list_user_ids(&self, after: Option<A2UserId>, limit: usize) -> Result<A2UserIdPage, ImportError> {
        self.check_available()?;
        let users = self
            .users
            .lock()
            .map_err(|_| ImportError::Source("A2 directory lock poisoned".to_string()))?;

        let user_ids = match after {
            Some(after) => users
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit)
                .copied()
                .collect(),
            None => users.iter().take(limit).copied().collect(),
        };

        Ok(A2UserIdPage {
            user_ids,
            highest_user_id: users.last().copied(),
        })
    }

    async fn ping(&self) -> Result<(), ImportError> {
        self.check_available()
    }
}

/// [`ImportSource`] over an [`A2UserDirectory`].
#[derive(Debug)]
pub struct A2UserIdSource<D> {
    directory: D,
    page_size: usize,
}

impl<D: A2UserDirectory> A2UserIdSource<D> {
    pub const DEFAULT_PAGE_SIZE: usize = 1_000;

    pub fn new(directory: D) -> Self {
        Self {
            directory,
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }
}

#[async_trait]
impl<D: A2UserDirectory> ImportSource for A2UserIdSource<D> {
    async fn fetch_page(&self, after: u64) -> Result<UpstreamPage, ImportError> {
        // Position 0 means nothing imported yet; it is not a user id.
        let after_id = A2UserId::new(after).ok();
        let page = self.directory.list_user_ids(after_id, self.page_size).await?;

        let mut previous = after;
        let mut positions = Vec::with_capacity(page.user_ids.len());
        for id in page.user_ids {
            let position = id.value();
            if position <= previous {
                return Err(ImportError::InvalidItem {
                    position,
                    reason: format!("not after {previous}; directory listing out of order"),
                });
            }
            previous = position;
            positions.push(position);
        }

        Ok(UpstreamPage {
            positions,
            source_max: page.highest_user_id.map(A2UserId::value),
        })
    }

    fn command_for(
        &self,
        job_id: &ImportJobId,
        position: u64,
        enqueued_at: DateTime<Utc>,
    ) -> Result<CommandEnvelope<JsonValue>, ImportError> {
        let user_id = A2UserId::new(position).map_err(|e| ImportError::InvalidItem {
            position,
            reason: e.to_string(),
        })?;
        let command = ImportA2UserParty::new(job_id.as_str(), user_id, enqueued_at);
        Ok(CommandEnvelope::from_command(&command)?)
    }
}

pub type A2UserIdImporter<D> = IncrementalImporter<A2UserIdSource<D>>;

/// One scheduled run of the A2 user import.
pub struct A2UserIdImportJob<D> {
    importer: Arc<A2UserIdImporter<D>>,
}

impl<D> A2UserIdImportJob<D> {
    pub fn new(importer: Arc<A2UserIdImporter<D>>) -> Self {
        Self { importer }
    }
}

#[async_trait]
impl<D: A2UserDirectory + 'static> Job for A2UserIdImportJob<D> {
    async fn run(&mut self, cancel: CancellationToken) -> Result<(), JobError> {
        let summary = self
            .importer
            .run(&cancel)
            .await
            .map_err(|e| JobError::Other(e.into()))?;

        if summary.stop == StopReason::Cancelled {
            warn!(sent = summary.sent, "A2 user import cancelled mid-run");
            return Err(JobError::Cancelled);
        }
        Ok(())
    }
}

/// Scheduler registration for the A2 user import.
///
/// Runs on its interval and once at startup, under the
/// `job:a2-user-id-import` lease, and waits for the directory to answer a
/// ping before the first run.
pub fn a2_user_id_import_registration<D>(
    config: &IncrementalImportConfig,
    importer: Arc<A2UserIdImporter<D>>,
) -> Result<JobRegistration, DomainError>
where
    D: A2UserDirectory + 'static,
{
    let lease = LeaseId::new(format!("job:{A2_USER_ID_IMPORT_JOB}"))?;
    let enabled = config.enabled;

    let for_jobs = importer.clone();
    let for_ready = importer;

    Ok(JobRegistration::new(A2_USER_ID_IMPORT_JOB, move || {
        Box::new(A2UserIdImportJob::new(for_jobs.clone())) as Box<dyn Job>
    })
    .with_lease(lease)
    .with_interval(config.interval)
    .run_at(HostLifecycle::Started)
    .with_tag("import")
    .with_tag("a2")
    .with_enabled(JobEnabled::builder().with_check(move || enabled).build())
    .with_wait_for_ready(move || {
        let importer = for_ready.clone();
        async move {
            importer
                .source()
                .directory()
                .ping()
                .await
                .map_err(|e| JobError::Other(e.into()))
        }
    }))
}
