//! Job registrations: static metadata the scheduler runs jobs from.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use registry_core::LeaseId;

use super::enabled::JobEnabled;
use crate::leases::{LeaseError, LeaseFilter};

/// Host lifecycle points a job can be triggered at, besides its interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostLifecycle {
    /// The scheduler has started.
    Started,
    /// The scheduler is shutting down (runs before in-flight work is cancelled).
    Stopping,
}

/// Failure of a job body, a readiness wait, or an enabled check.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// One run's worth of work.
///
/// A fresh instance is built for every run, after the job has been found
/// enabled and its lease (if any) is held.
#[async_trait]
pub trait Job: Send {
    /// Per-run check, made after the lease is held. Skips the run if false.
    async fn should_run(&mut self) -> Result<bool, JobError> {
        Ok(true)
    }

    /// Run the job. `cancel` fires on shutdown or when the job's lease is
    /// lost; the body must honor it at safe points.
    async fn run(&mut self, cancel: CancellationToken) -> Result<(), JobError>;
}

pub type JobFactory = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;
pub type WaitForReady = Arc<dyn Fn() -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// Static description of a recurring job.
#[derive(Clone)]
pub struct JobRegistration {
    name: String,
    lease_name: Option<LeaseId>,
    lease_filter: Option<Arc<LeaseFilter>>,
    interval: Option<Duration>,
    run_at: HashSet<HostLifecycle>,
    tags: BTreeSet<String>,
    enabled: JobEnabled,
    wait_for_ready: Option<WaitForReady>,
    factory: JobFactory,
}

impl std::fmt::Debug for JobRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistration")
            .field("name", &self.name)
            .field("lease_name", &self.lease_name)
            .field("interval", &self.interval)
            .field("run_at", &self.run_at)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl JobRegistration {
    /// Register a job under a unique `name`; `factory` builds one instance per run.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Job> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            lease_name: None,
            lease_filter: None,
            interval: None,
            run_at: HashSet::new(),
            tags: BTreeSet::new(),
            enabled: JobEnabled::always(),
            wait_for_ready: None,
            factory: Arc::new(factory),
        }
    }

    /// Hold this lease for the duration of each run.
    pub fn with_lease(mut self, lease_name: LeaseId) -> Self {
        self.lease_name = Some(lease_name);
        self
    }

    /// Extra acquisition condition for the job's lease.
    pub fn with_lease_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&crate::leases::LeaseInfo) -> bool + Send + Sync + 'static,
    {
        self.lease_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn run_at(mut self, point: HostLifecycle) -> Self {
        self.run_at.insert(point);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_enabled(mut self, enabled: JobEnabled) -> Self {
        self.enabled = enabled;
        self
    }

    /// One-time initializer awaited before the first run.
    pub fn with_wait_for_ready<F, Fut>(mut self, ready: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.wait_for_ready = Some(Arc::new(move || ready().boxed()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lease_name(&self) -> Option<&LeaseId> {
        self.lease_name.as_ref()
    }

    pub fn lease_filter(&self) -> Option<&LeaseFilter> {
        self.lease_filter.as_deref()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn runs_at(&self, point: HostLifecycle) -> bool {
        self.run_at.contains(&point)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn enabled(&self) -> &JobEnabled {
        &self.enabled
    }

    pub(crate) fn wait_for_ready(&self) -> Option<&WaitForReady> {
        self.wait_for_ready.as_ref()
    }

    pub(crate) fn build_job(&self) -> Box<dyn Job> {
        (self.factory)()
    }
}
