//! Composable "is this job enabled" predicate.
//!
//! Runs on every tick of every registration, and most checks are plain
//! configuration reads. Evaluation therefore runs checks inline until one
//! actually suspends; only the remainder is boxed into a future.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::registration::JobError;

type SyncCheck = Arc<dyn Fn() -> Result<bool, JobError> + Send + Sync>;
type AsyncCheck = Arc<dyn Fn() -> BoxFuture<'static, Result<bool, JobError>> + Send + Sync>;

#[derive(Clone)]
enum Check {
    Sync(SyncCheck),
    Async(AsyncCheck),
}

/// Builds a [`JobEnabled`] from independent checks, evaluated in order.
#[derive(Default)]
pub struct JobEnabledBuilder {
    checks: Vec<Check>,
}

impl JobEnabledBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.checks.push(Check::Sync(Arc::new(move || Ok(check()))));
        self
    }

    pub fn with_fallible_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> Result<bool, JobError> + Send + Sync + 'static,
    {
        self.checks.push(Check::Sync(Arc::new(check)));
        self
    }

    /// A check that may suspend (remote flag service, health endpoint).
    pub fn with_async_check<F, Fut>(mut self, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, JobError>> + Send + 'static,
    {
        self.checks
            .push(Check::Async(Arc::new(move || check().boxed())));
        self
    }

    pub fn build(self) -> JobEnabled {
        JobEnabled {
            checks: self.checks.into(),
        }
    }
}

/// Short-circuiting conjunction of enabled checks.
#[derive(Clone)]
pub struct JobEnabled {
    checks: Arc<[Check]>,
}

impl std::fmt::Debug for JobEnabled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEnabled")
            .field("checks", &self.checks.len())
            .finish()
    }
}

/// Result of [`JobEnabled::evaluate`].
pub enum EnabledEvaluation {
    /// Every check that ran completed inline.
    Ready(Result<bool, JobError>),
    /// A check suspended; the future finishes it and the remaining checks.
    Pending(BoxFuture<'static, Result<bool, JobError>>),
}

impl JobEnabled {
    /// No checks: always enabled.
    pub fn always() -> Self {
        JobEnabledBuilder::new().build()
    }

    pub fn builder() -> JobEnabledBuilder {
        JobEnabledBuilder::new()
    }

    /// Evaluate checks in order, stopping at the first `false` or error.
    ///
    /// Checks that complete without suspending never leave this call.
    pub fn evaluate(&self) -> EnabledEvaluation {
        for (index, check) in self.checks.iter().enumerate() {
            let outcome = match check {
                Check::Sync(check) => check(),
                Check::Async(check) => {
                    let mut pending = check();
                    match (&mut pending).now_or_never() {
                        Some(outcome) => outcome,
                        None => return EnabledEvaluation::Pending(self.resume(pending, index + 1)),
                    }
                }
            };
            match outcome {
                Ok(true) => continue,
                other => return EnabledEvaluation::Ready(other),
            }
        }
        EnabledEvaluation::Ready(Ok(true))
    }

    pub async fn is_enabled(&self) -> Result<bool, JobError> {
        match self.evaluate() {
            EnabledEvaluation::Ready(outcome) => outcome,
            EnabledEvaluation::Pending(rest) => rest.await,
        }
    }

    fn resume(
        &self,
        pending: BoxFuture<'static, Result<bool, JobError>>,
        next: usize,
    ) -> BoxFuture<'static, Result<bool, JobError>> {
        let checks = self.checks.clone();
        async move {
            if !pending.await? {
                return Ok(false);
            }
            for check in &checks[next..] {
                let enabled = match check {
                    Check::Sync(check) => check()?,
                    Check::Async(check) => check().await?,
                };
                if !enabled {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        .boxed()
    }
}
