//! Recurring jobs: registrations, enabled checks and the lease-gated scheduler.

pub mod enabled;
pub mod registration;
pub mod scheduler;

pub use enabled::{EnabledEvaluation, JobEnabled, JobEnabledBuilder};
pub use registration::{HostLifecycle, Job, JobError, JobFactory, JobRegistration, WaitForReady};
pub use scheduler::{JobRunState, RecurringJobScheduler, SchedulerError, TickOutcome};
