//! Wiring: build the registry's coordination services from configuration.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

use registry_core::{Clock, DomainError, SystemClock};
use registry_messaging::CommandBus;
use registry_observability::{ImportMetrics, SchedulerMetrics};

use crate::config::{ConfigError, RegistryConfig};
use crate::db;
use crate::import::{
    A2UserDirectory, A2UserIdSource, ImportDependencies, ImportItemStore, InMemoryImportItemStore,
    IncrementalImporter, PostgresImportItemStore, a2_user_id_import_job_id, a2_user_id_import_registration,
};
use crate::import_jobs::{ImportJobTracker, InMemoryImportJobTracker, PostgresImportJobTracker};
use crate::jobs::{RecurringJobScheduler, SchedulerError};
use crate::leases::{InMemoryLeaseProvider, LeaseManager, PostgresLeaseProvider};

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Shared coordination services of one registry process.
#[derive(Clone)]
pub struct RegistryServices {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    leases: Arc<LeaseManager>,
    tracker: Arc<dyn ImportJobTracker>,
    items: Arc<dyn ImportItemStore>,
    scheduler_metrics: Arc<SchedulerMetrics>,
    import_metrics: Arc<ImportMetrics>,
}

impl std::fmt::Debug for RegistryServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RegistryServices {
    /// Connect to Postgres, apply migrations and build Postgres-backed services.
    pub async fn connect(config: RegistryConfig) -> Result<(Self, PgPool), ServicesError> {
        config.validate()?;

        let pool = db::connect_pool(&config.database).await?;
        db::run_migrations(&pool).await?;
        info!("registry schema up to date");

        let leases = PostgresLeaseProvider::new(pool.clone()).with_retry_policy(config.lease.retry.clone());
        let services = Self::assemble(
            config,
            Arc::new(SystemClock),
            Arc::new(leases),
            Arc::new(PostgresImportJobTracker::new(pool.clone())),
            Arc::new(PostgresImportItemStore::new(pool.clone())),
        )?;
        Ok((services, pool))
    }

    /// In-memory services for dev and tests; single process only.
    pub fn in_memory(config: RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self, ServicesError> {
        config.validate()?;
        let leases = InMemoryLeaseProvider::new(clock.clone());
        Self::assemble(
            config,
            clock,
            Arc::new(leases),
            Arc::new(InMemoryImportJobTracker::new()),
            Arc::new(InMemoryImportItemStore::new()),
        )
    }

    fn assemble(
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn crate::leases::LeaseProvider>,
        tracker: Arc<dyn ImportJobTracker>,
        items: Arc<dyn ImportItemStore>,
    ) -> Result<Self, ServicesError> {
        let leases = LeaseManager::new(provider, config.lease.clone())?.with_clock(clock.clone());
        Ok(Self {
            config,
            clock,
            leases: Arc::new(leases),
            tracker,
            items,
            scheduler_metrics: Arc::new(SchedulerMetrics::new()),
            import_metrics: Arc::new(ImportMetrics::new()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn tracker(&self) -> &Arc<dyn ImportJobTracker> {
        &self.tracker
    }

    pub fn items(&self) -> &Arc<dyn ImportItemStore> {
        &self.items
    }

    pub fn scheduler_metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.scheduler_metrics
    }

    pub fn import_metrics(&self) -> &Arc<ImportMetrics> {
        &self.import_metrics
    }

    /// Scheduler with the A2 user import registered; not yet started.
    pub fn a2_import_scheduler<D>(
        &self,
        directory: D,
        bus: Arc<dyn CommandBus>,
    ) -> Result<RecurringJobScheduler, ServicesError>
    where
        D: A2UserDirectory + 'static,
    {
        let deps = ImportDependencies {
            tracker: self.tracker.clone(),
            items: self.items.clone(),
            bus,
        };
        let importer = IncrementalImporter::new(
            a2_user_id_import_job_id()?,
            A2UserIdSource::new(directory),
            deps,
            &self.config.a2_import,
        )
        .with_clock(self.clock.clone())
        .with_metrics(self.import_metrics.clone());

        let mut scheduler = RecurringJobScheduler::new(self.leases.clone(), self.config.scheduler.clone())
            .with_metrics(self.scheduler_metrics.clone());
        scheduler.register(a2_user_id_import_registration(&self.config.a2_import, Arc::new(importer))?)?;
        Ok(scheduler)
    }
}
