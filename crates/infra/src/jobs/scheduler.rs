//! Recurring job scheduler.
//!
//! One task per registration ticks on the registration's interval. Each tick
//! walks `Idle -> Checking -> LeaseWait -> Running -> Idle`:
//!
//! 1. evaluate the enabled predicate (false makes the registration `Disabled`
//!    for the rest of the process lifetime; the job is never built)
//! 2. await `wait_for_ready` once per registration
//! 3. acquire the job's lease, if it has one; skip the tick if someone else holds it
//! 4. build the job, ask `should_run`, run it
//! 5. release the lease, whatever the run's outcome
//!
//! Runs of one registration never overlap within a process; the lease keeps
//! them from overlapping across processes. A panic in any of these steps
//! fails that tick only.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use registry_observability::SchedulerMetrics;

use super::registration::{HostLifecycle, JobError, JobRegistration};
use crate::config::SchedulerConfig;
use crate::leases::{Lease, LeaseError, LeaseManager};

/// Where a registration is in its tick cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRunState {
    Idle,
    Checking,
    LeaseWait,
    Running,
    /// Terminal: the enabled predicate returned false.
    Disabled,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    /// The job body (or lease handling) failed; later ticks still run.
    Failed(String),
    /// The registration is disabled.
    Disabled,
    /// An enabled check errored; only this tick is affected.
    CheckFailed(String),
    /// `wait_for_ready` failed; it is retried on the next tick.
    NotReady(String),
    /// Another host holds the job's lease.
    LeaseHeldElsewhere { expires: Option<DateTime<Utc>> },
    /// The job's own `should_run` declined.
    ShouldNotRun,
    /// Shutdown or lease loss stopped the run.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("a job named '{0}' is already registered")]
    DuplicateJob(String),

    #[error("no job named '{0}'")]
    UnknownJob(String),

    #[error("job '{0}' has a zero interval")]
    ZeroInterval(String),

    #[error("scheduler already started")]
    AlreadyStarted,
}

struct JobRunner {
    registration: JobRegistration,
    run_lock: tokio::sync::Mutex<()>,
    ready: tokio::sync::OnceCell<()>,
    state: Mutex<JobRunState>,
}

#[derive(Clone)]
struct TickContext {
    leases: Arc<LeaseManager>,
    metrics: Arc<SchedulerMetrics>,
    shutdown: CancellationToken,
}

pub struct RecurringJobScheduler {
    runners: BTreeMap<String, Arc<JobRunner>>,
    ctx: TickContext,
    config: SchedulerConfig,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for RecurringJobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringJobScheduler")
            .field("jobs", &self.runners.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RecurringJobScheduler {
    pub fn new(leases: Arc<LeaseManager>, config: SchedulerConfig) -> Self {
        Self {
            runners: BTreeMap::new(),
            ctx: TickContext {
                leases,
                metrics: Arc::new(SchedulerMetrics::new()),
                shutdown: CancellationToken::new(),
            },
            config,
            tasks: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SchedulerMetrics>) -> Self {
        self.ctx.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.ctx.metrics
    }

    pub fn register(&mut self, registration: JobRegistration) -> Result<(), SchedulerError> {
        let name = registration.name().to_string();
        if self.runners.contains_key(&name) {
            return Err(SchedulerError::DuplicateJob(name));
        }
        if registration.interval().is_some_and(|period| period.is_zero()) {
            return Err(SchedulerError::ZeroInterval(name));
        }
        self.runners.insert(
            name,
            Arc::new(JobRunner {
                registration,
                run_lock: tokio::sync::Mutex::new(()),
                ready: tokio::sync::OnceCell::new(),
                state: Mutex::new(JobRunState::Idle),
            }),
        );
        Ok(())
    }

    /// Spawn one ticking task per registration.
    ///
    /// Registrations that run at [`HostLifecycle::Started`] tick immediately.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if tasks.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let handles = self
            .runners
            .values()
            .map(|runner| tokio::spawn(drive(runner.clone(), self.ctx.clone())))
            .collect();
        *tasks = Some(handles);

        info!(jobs = self.runners.len(), "recurring job scheduler started");
        Ok(())
    }

    /// Cancel in-flight runs, run `Stopping` jobs, then stop ticking.
    ///
    /// Everything shares one `shutdown_grace` deadline: `Stopping` runs still
    /// going when it passes are dropped, and ticking tasks are aborted.
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + self.config.shutdown_grace;
        let handles = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .unwrap_or_default();

        self.ctx.shutdown.cancel();

        // Stopping runs get their own token; the scheduler's is already cancelled.
        let stopping = TickContext {
            shutdown: CancellationToken::new(),
            ..self.ctx.clone()
        };
        for runner in self.runners.values() {
            if !runner.registration.runs_at(HostLifecycle::Stopping) {
                continue;
            }
            let name = runner.registration.name();
            match tokio::time::timeout_at(deadline, runner.tick(&stopping)).await {
                Ok(outcome) => debug!(job = %name, ?outcome, "stopping run finished"),
                Err(_) => warn!(job = %name, "stopping run did not finish within the shutdown grace period"),
            }
        }
        stopping.shutdown.cancel();

        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("job did not stop within the shutdown grace period; aborting");
                handle.abort();
            }
        }

        info!("recurring job scheduler stopped");
    }

    /// Run one tick of `name` now, waiting for any in-flight run first.
    pub async fn trigger(&self, name: &str) -> Result<TickOutcome, SchedulerError> {
        let runner = self
            .runners
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        Ok(runner.tick(&self.ctx).await)
    }

    pub fn state(&self, name: &str) -> Option<JobRunState> {
        self.runners.get(name).map(|runner| runner.state())
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }
}

async fn drive(runner: Arc<JobRunner>, ctx: TickContext) {
    let name = runner.registration.name().to_string();

    if runner.registration.runs_at(HostLifecycle::Started) && !ctx.shutdown.is_cancelled() {
        let outcome = runner.tick(&ctx).await;
        debug!(job = %name, ?outcome, "startup run finished");
    }

    let Some(period) = runner.registration.interval() else {
        return;
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if runner.state() == JobRunState::Disabled {
            debug!(job = %name, "job disabled; no further ticks");
            return;
        }

        tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let outcome = runner.tick(&ctx).await;
        debug!(job = %name, ?outcome, "scheduled run finished");
    }
}

impl JobRunner {
    fn state(&self) -> JobRunState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: JobRunState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn finish(&self, outcome: TickOutcome) -> TickOutcome {
        self.set_state(JobRunState::Idle);
        outcome
    }

    async fn tick(&self, ctx: &TickContext) -> TickOutcome {
        let _running = self.run_lock.lock().await;
        let name = self.registration.name();
        ctx.metrics.record_tick();

        if self.state() == JobRunState::Disabled {
            ctx.metrics.record_skipped_disabled();
            return TickOutcome::Disabled;
        }

        self.set_state(JobRunState::Checking);
        let enabled = AssertUnwindSafe(self.registration.enabled().is_enabled())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(JobError::failed(panic_message(panic, "enabled check panicked"))));
        match enabled {
            Ok(true) => {}
            Ok(false) => {
                info!(job = %name, "job is disabled for this process");
                self.set_state(JobRunState::Disabled);
                ctx.metrics.record_skipped_disabled();
                return TickOutcome::Disabled;
            }
            Err(err) => {
                error!(job = %name, error = %err, "enabled check failed");
                ctx.metrics.record_failure();
                return self.finish(TickOutcome::CheckFailed(err.to_string()));
            }
        }

        if let Some(init) = self.registration.wait_for_ready() {
            let ready = AssertUnwindSafe(self.ready.get_or_try_init(|| init()))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(JobError::failed(panic_message(panic, "wait_for_ready panicked"))));
            if let Err(err) = ready {
                warn!(job = %name, error = %err, "job not ready");
                return self.finish(TickOutcome::NotReady(err.to_string()));
            }
        }

        let lease = match self.registration.lease_name() {
            None => None,
            Some(lease_name) => {
                self.set_state(JobRunState::LeaseWait);
                match ctx
                    .leases
                    .acquire_lease(lease_name, self.registration.lease_filter(), &ctx.shutdown)
                    .await
                {
                    Ok(lease) if lease.is_acquired() => Some(lease),
                    Ok(lease) => {
                        debug!(job = %name, lease = %lease_name, "lease held elsewhere; skipping run");
                        ctx.metrics.record_skipped_lease_held();
                        return self.finish(TickOutcome::LeaseHeldElsewhere {
                            expires: lease.expires(),
                        });
                    }
                    Err(LeaseError::Cancelled) => return self.finish(TickOutcome::Cancelled),
                    Err(err) => {
                        error!(job = %name, lease = %lease_name, error = %err, "lease acquisition failed");
                        ctx.metrics.record_failure();
                        return self.finish(TickOutcome::Failed(err.to_string()));
                    }
                }
            }
        };

        let cancel = lease
            .as_ref()
            .and_then(Lease::cancellation_token)
            .unwrap_or_else(|| ctx.shutdown.child_token());

        self.set_state(JobRunState::Running);
        let outcome = self.run_job(cancel).await;

        if let Some(lease) = lease {
            if let Err(err) = lease.release().await {
                warn!(job = %name, error = %err, "lease release failed; it will expire");
            }
        }

        match &outcome {
            TickOutcome::Completed => ctx.metrics.record_success(),
            TickOutcome::ShouldNotRun => ctx.metrics.record_skipped_should_run(),
            TickOutcome::Failed(_) => ctx.metrics.record_failure(),
            _ => {}
        }
        self.finish(outcome)
    }

    async fn run_job(&self, cancel: CancellationToken) -> TickOutcome {
        let name = self.registration.name();
        let mut job = self.registration.build_job();

        let body = async {
            if !job.should_run().await? {
                return Ok(false);
            }
            job.run(cancel).await?;
            Ok::<bool, JobError>(true)
        };

        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(Ok(true)) => {
                info!(job = %name, "job run completed");
                TickOutcome::Completed
            }
            Ok(Ok(false)) => {
                debug!(job = %name, "job declined to run");
                TickOutcome::ShouldNotRun
            }
            Ok(Err(JobError::Cancelled)) => {
                info!(job = %name, "job run cancelled");
                TickOutcome::Cancelled
            }
            Ok(Err(err)) => {
                error!(job = %name, error = %err, "job run failed");
                TickOutcome::Failed(err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic, "job panicked");
                error!(job = %name, panic = %message, "job run panicked");
                TickOutcome::Failed(message)
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>, fallback: &str) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use registry_core::LeaseId;

    use crate::config::LeaseConfig;
    use crate::jobs::{Job, JobEnabled};
    use crate::leases::InMemoryLeaseProvider;
    use crate::test_support::{CountingLeaseProvider, TokioClock};

    /// Counters shared between a test and the job instances it registers.
    #[derive(Default)]
    struct RunCounts {
        built: AtomicUsize,
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    type Behavior = Arc<dyn Fn(usize, CancellationToken) -> futures::future::BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

    struct CountedJob {
        counts: Arc<RunCounts>,
        should_run: bool,
        behavior: Behavior,
    }

    #[async_trait]
    impl Job for CountedJob {
        async fn should_run(&mut self) -> Result<bool, JobError> {
            Ok(self.should_run)
        }

        async fn run(&mut self, cancel: CancellationToken) -> Result<(), JobError> {
            let run = self.counts.runs.fetch_add(1, Ordering::SeqCst);
            let active = self.counts.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.counts.max_active.fetch_max(active, Ordering::SeqCst);
            let result = (self.behavior)(run, cancel).await;
            self.counts.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn registration(name: &str, counts: &Arc<RunCounts>, should_run: bool, behavior: Behavior) -> JobRegistration {
        let counts = counts.clone();
        JobRegistration::new(name, move || {
            counts.built.fetch_add(1, Ordering::SeqCst);
            Box::new(CountedJob {
                counts: counts.clone(),
                should_run,
                behavior: behavior.clone(),
            }) as Box<dyn Job>
        })
    }

    fn sleeps(secs: u64) -> Behavior {
        Arc::new(move |_, _| {
            async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok(())
            }
            .boxed()
        })
    }

    fn succeeds() -> Behavior {
        Arc::new(|_, _| async { Ok(()) }.boxed())
    }

    fn lease_setup() -> (Arc<CountingLeaseProvider<InMemoryLeaseProvider>>, Arc<LeaseManager>) {
        let clock = TokioClock::arc();
        let provider = CountingLeaseProvider::arc(InMemoryLeaseProvider::new(clock.clone()));
        let config = LeaseConfig::default()
            .with_duration(Duration::from_secs(10))
            .with_renewal_margin(Duration::from_secs(2));
        let manager = Arc::new(LeaseManager::new(provider.clone(), config).unwrap().with_clock(clock));
        (provider, manager)
    }

    fn scheduler(leases: &Arc<LeaseManager>) -> RecurringJobScheduler {
        RecurringJobScheduler::new(leases.clone(), SchedulerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn runs_of_one_registration_never_overlap() {
        let (_provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let mut scheduler = scheduler(&leases);
        scheduler
            .register(registration("slow", &counts, true, sleeps(10)).with_interval(Duration::from_secs(1)))
            .unwrap();
        scheduler.start().unwrap();

        let (a, b) = tokio::join!(scheduler.trigger("slow"), scheduler.trigger("slow"));
        assert_eq!(a.unwrap(), TickOutcome::Completed);
        assert_eq!(b.unwrap(), TickOutcome::Completed);

        tokio::time::sleep(Duration::from_secs(25)).await;
        scheduler.shutdown().await;

        assert!(counts.runs.load(Ordering::SeqCst) >= 3);
        assert_eq!(counts.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_registration_is_terminal_and_never_built() {
        let (_provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let checks = Arc::new(AtomicUsize::new(0));
        let counted = checks.clone();
        let enabled = JobEnabled::builder()
            .with_check(move || {
                counted.fetch_add(1, Ordering::SeqCst);
                false
            })
            .build();

        let mut scheduler = scheduler(&leases);
        scheduler
            .register(registration("off", &counts, true, succeeds()).with_enabled(enabled))
            .unwrap();

        assert_eq!(scheduler.trigger("off").await.unwrap(), TickOutcome::Disabled);
        assert_eq!(scheduler.trigger("off").await.unwrap(), TickOutcome::Disabled);

        assert_eq!(scheduler.state("off"), Some(JobRunState::Disabled));
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        assert_eq!(counts.built.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.metrics().snapshot().skipped_disabled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_check_only_skips_that_tick() {
        let (_provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let enabled = JobEnabled::builder()
            .with_fallible_check(move || {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(JobError::failed("flags unavailable"))
                } else {
                    Ok(true)
                }
            })
            .build();

        let mut scheduler = scheduler(&leases);
        scheduler
            .register(registration("flaky-check", &counts, true, succeeds()).with_enabled(enabled))
            .unwrap();

        assert!(matches!(scheduler.trigger("flaky-check").await.unwrap(), TickOutcome::CheckFailed(_)));
        assert_eq!(scheduler.state("flaky-check"), Some(JobRunState::Idle));
        assert_eq!(scheduler.trigger("flaky-check").await.unwrap(), TickOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_admits_one_host_at_a_time() {
        let (provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let lease = LeaseId::new("job:exclusive").unwrap();

        // Two hosts sharing one lease store.
        let mut host_a = scheduler(&leases);
        let mut host_b = scheduler(&leases);
        host_a
            .register(registration("exclusive", &counts, true, sleeps(5)).with_lease(lease.clone()))
            .unwrap();
        host_b
            .register(registration("exclusive", &counts, true, sleeps(5)).with_lease(lease.clone()))
            .unwrap();

        let (a, b) = tokio::join!(host_a.trigger("exclusive"), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            host_b.trigger("exclusive").await
        });

        assert_eq!(a.unwrap(), TickOutcome::Completed);
        assert!(matches!(b.unwrap(), TickOutcome::LeaseHeldElsewhere { expires: Some(_) }));
        assert_eq!(counts.built.load(Ordering::SeqCst), 1);
        assert_eq!(provider.releases(), 1);

        // Released after the run, so the other host can go next.
        assert_eq!(host_b.trigger("exclusive").await.unwrap(), TickOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_and_panics_do_not_stop_the_schedule() {
        let (provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let behavior: Behavior = Arc::new(|run, _| {
            async move {
                match run {
                    0 => Err(JobError::failed("upstream timeout")),
                    1 => panic!("corrupt page"),
                    _ => Ok(()),
                }
            }
            .boxed()
        });

        let mut scheduler = scheduler(&leases);
        scheduler
            .register(
                registration("bumpy", &counts, true, behavior)
                    .with_lease(LeaseId::new("job:bumpy").unwrap())
                    .with_interval(Duration::from_secs(10)),
            )
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        scheduler.shutdown().await;

        let metrics = scheduler.metrics().snapshot();
        assert_eq!(counts.runs.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.runs_failed, 2);
        assert_eq!(metrics.runs_succeeded, 1);
        // Lease released after every run, including the failed ones.
        assert_eq!(provider.releases(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn should_run_false_skips_and_releases() {
        let (provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let mut scheduler = scheduler(&leases);
        scheduler
            .register(
                registration("picky", &counts, false, succeeds())
                    .with_lease(LeaseId::new("job:picky").unwrap()),
            )
            .unwrap();

        assert_eq!(scheduler.trigger("picky").await.unwrap(), TickOutcome::ShouldNotRun);
        assert_eq!(counts.built.load(Ordering::SeqCst), 1);
        assert_eq!(counts.runs.load(Ordering::SeqCst), 0);
        assert_eq!(provider.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_ready_runs_once() {
        let (_provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let readies = Arc::new(AtomicUsize::new(0));
        let counted = readies.clone();

        let mut scheduler = scheduler(&leases);
        scheduler
            .register(registration("warm", &counts, true, succeeds()).with_wait_for_ready(move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();

        for _ in 0..3 {
            assert_eq!(scheduler.trigger("warm").await.unwrap(), TickOutcome::Completed);
        }
        assert_eq!(readies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_cancels_the_running_job() {
        let (provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let behavior: Behavior = Arc::new(|_, cancel| {
            async move {
                cancel.cancelled().await;
                Err(JobError::Cancelled)
            }
            .boxed()
        });

        let mut scheduler = scheduler(&leases);
        scheduler
            .register(registration("long", &counts, true, behavior).with_lease(LeaseId::new("job:long").unwrap()))
            .unwrap();

        provider.reject_renewals(true);
        assert_eq!(scheduler.trigger("long").await.unwrap(), TickOutcome::Cancelled);
        assert_eq!(provider.renewals(), 1);
        // The rejection never reached the store, so the row is still ours to release.
        assert_eq!(provider.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_jobs_run_at_start_and_stop() {
        let (_provider, leases) = lease_setup();
        let on_start = Arc::new(RunCounts::default());
        let on_stop = Arc::new(RunCounts::default());

        let mut scheduler = scheduler(&leases);
        scheduler
            .register(registration("warmup", &on_start, true, succeeds()).run_at(HostLifecycle::Started))
            .unwrap();
        scheduler
            .register(registration("flush", &on_stop, true, succeeds()).run_at(HostLifecycle::Stopping))
            .unwrap();

        scheduler.start().unwrap();
        assert_eq!(scheduler.start(), Err(SchedulerError::AlreadyStarted));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(on_start.runs.load(Ordering::SeqCst), 1);
        assert_eq!(on_stop.runs.load(Ordering::SeqCst), 0);

        scheduler.shutdown().await;
        assert_eq!(on_start.runs.load(Ordering::SeqCst), 1);
        assert_eq!(on_stop.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_and_unknown_names() {
        let (_provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let mut scheduler = scheduler(&leases);

        scheduler.register(registration("dup", &counts, true, succeeds())).unwrap();
        assert_eq!(
            scheduler.register(registration("dup", &counts, true, succeeds())),
            Err(SchedulerError::DuplicateJob("dup".to_string()))
        );
        assert_eq!(
            scheduler.trigger("missing").await,
            Err(SchedulerError::UnknownJob("missing".to_string()))
        );
    }

    #[test]
    fn rejects_a_zero_interval() {
        let (_provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let mut scheduler = scheduler(&leases);

        assert_eq!(
            scheduler.register(registration("busy", &counts, true, succeeds()).with_interval(Duration::ZERO)),
            Err(SchedulerError::ZeroInterval("busy".to_string()))
        );
        assert_eq!(scheduler.job_names().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_bounded_by_the_grace_period() {
        let (_provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let config = SchedulerConfig::default().with_shutdown_grace(Duration::from_secs(1));
        let mut scheduler = RecurringJobScheduler::new(leases.clone(), config);
        // Ignores cancellation, both on its interval and at Stopping.
        scheduler
            .register(
                registration("stubborn", &counts, true, sleeps(1000))
                    .with_lease(LeaseId::new("job:stubborn").unwrap())
                    .with_interval(Duration::from_secs(1))
                    .run_at(HostLifecycle::Stopping),
            )
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counts.active.load(Ordering::SeqCst), 1);

        let started = Instant::now();
        scheduler.shutdown().await;

        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(counts.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_runs_are_not_cancelled_by_shutdown() {
        let (_provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let behavior: Behavior = Arc::new(|_, cancel| {
            async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                if cancel.is_cancelled() { Err(JobError::Cancelled) } else { Ok(()) }
            }
            .boxed()
        });
        let mut scheduler = scheduler(&leases);
        scheduler
            .register(
                registration("flush", &counts, true, behavior)
                    .with_lease(LeaseId::new("job:flush").unwrap())
                    .run_at(HostLifecycle::Stopping),
            )
            .unwrap();
        scheduler.start().unwrap();

        scheduler.shutdown().await;

        assert_eq!(counts.runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.metrics().snapshot().runs_succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_checks_only_fail_that_tick() {
        let (_provider, leases) = lease_setup();
        let counts = Arc::new(RunCounts::default());
        let checks = Arc::new(AtomicUsize::new(0));
        let counted = checks.clone();
        let enabled = JobEnabled::builder()
            .with_check(move || {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("flag client not initialised");
                }
                true
            })
            .build();
        let readies = Arc::new(AtomicUsize::new(0));
        let counted = readies.clone();

        let mut scheduler = scheduler(&leases);
        scheduler
            .register(
                registration("fragile", &counts, true, succeeds())
                    .with_enabled(enabled)
                    .with_wait_for_ready(move || {
                        let attempt = counted.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if attempt == 0 {
                                panic!("schema cache missing");
                            }
                            Ok(())
                        }
                    })
                    .with_interval(Duration::from_secs(1)),
            )
            .unwrap();

        assert_eq!(
            scheduler.trigger("fragile").await.unwrap(),
            TickOutcome::CheckFailed("job failed: flag client not initialised".to_string())
        );
        assert_eq!(scheduler.state("fragile"), Some(JobRunState::Idle));
        assert_eq!(
            scheduler.trigger("fragile").await.unwrap(),
            TickOutcome::NotReady("job failed: schema cache missing".to_string())
        );

        // The ticking task survives both and runs the job on its interval.
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.shutdown().await;

        assert_eq!(counts.runs.load(Ordering::SeqCst), 1);
        assert_eq!(readies.load(Ordering::SeqCst), 2);
    }
}
