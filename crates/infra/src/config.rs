//! Configuration loading and representation.
//!
//! Everything is read from environment variables with defaults for all but
//! `DATABASE_URL`. [`RegistryConfig::from_lookup`] takes any key/value source
//! so tests don't have to touch the process environment.

use std::str::FromStr;
use std::time::Duration;

use registry_observability::{LogFormat, TracingConfig};

use crate::leases::MAX_LEASE_DURATION;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Lease timing shared by every lease a [`crate::leases::LeaseManager`] hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Requested duration for acquire and each renewal.
    pub duration: Duration,
    /// How long before expiry a renewal is attempted.
    pub renewal_margin: Duration,
    /// Retry policy for serialization failures in the lease store.
    pub retry: RetryPolicy,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            renewal_margin: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl LeaseConfig {
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_renewal_margin(mut self, margin: Duration) -> Self {
        self.renewal_margin = margin;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration.is_zero() || self.duration >= MAX_LEASE_DURATION {
            return Err(ConfigError::Invalid {
                key: "REGISTRY_LEASE_DURATION_SECS",
                value: self.duration.as_secs().to_string(),
                reason: format!("must be positive and below {}s", MAX_LEASE_DURATION.as_secs()),
            });
        }
        if self.renewal_margin >= self.duration {
            return Err(ConfigError::Invalid {
                key: "REGISTRY_LEASE_RENEWAL_MARGIN_SECS",
                value: self.renewal_margin.as_secs().to_string(),
                reason: "must be shorter than the lease duration".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How long shutdown waits for in-flight runs before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Settings for one incremental import job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalImportConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Items per bus batch.
    pub batch_size: usize,
    /// Unprocessed backlog above which a run stops enqueueing.
    pub max_unprocessed: u64,
}

impl Default for IncrementalImportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            batch_size: 100,
            max_unprocessed: 50_000,
        }
    }
}

impl IncrementalImportConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_unprocessed(mut self, max: u64) -> Self {
        self.max_unprocessed = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "REGISTRY_A2_IMPORT_BATCH_SIZE",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "REGISTRY_A2_IMPORT_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Full process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub database: DatabaseConfig,
    pub lease: LeaseConfig,
    pub scheduler: SchedulerConfig,
    pub a2_import: IncrementalImportConfig,
    pub tracing: TracingConfig,
}

impl RegistryConfig {
    /// Check every section; configs built in code skip the checks done while loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lease.validate()?;
        self.a2_import.validate()
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let mut database = DatabaseConfig::new(url);
        if let Some(max) = parse(&lookup, "REGISTRY_DB_MAX_CONNECTIONS")? {
            database = database.with_max_connections(max);
        }

        let mut lease = LeaseConfig::default();
        if let Some(secs) = parse::<u64>(&lookup, "REGISTRY_LEASE_DURATION_SECS")? {
            lease = lease.with_duration(Duration::from_secs(secs));
        }
        if let Some(secs) = parse::<u64>(&lookup, "REGISTRY_LEASE_RENEWAL_MARGIN_SECS")? {
            lease = lease.with_renewal_margin(Duration::from_secs(secs));
        }
        lease.validate()?;

        let mut scheduler = SchedulerConfig::default();
        if let Some(secs) = parse::<u64>(&lookup, "REGISTRY_SCHEDULER_SHUTDOWN_GRACE_SECS")? {
            scheduler = scheduler.with_shutdown_grace(Duration::from_secs(secs));
        }

        let mut a2_import = IncrementalImportConfig::default();
        if let Some(enabled) = parse_flag(&lookup, "REGISTRY_A2_IMPORT_ENABLED")? {
            a2_import = a2_import.with_enabled(enabled);
        }
        if let Some(secs) = parse::<u64>(&lookup, "REGISTRY_A2_IMPORT_INTERVAL_SECS")? {
            a2_import = a2_import.with_interval(Duration::from_secs(secs));
        }
        if let Some(size) = parse(&lookup, "REGISTRY_A2_IMPORT_BATCH_SIZE")? {
            a2_import = a2_import.with_batch_size(size);
        }
        if let Some(max) = parse(&lookup, "REGISTRY_A2_IMPORT_MAX_UNPROCESSED")? {
            a2_import = a2_import.with_max_unprocessed(max);
        }
        a2_import.validate()?;

        let mut tracing = TracingConfig::default();
        if let Some(format) = lookup("REGISTRY_LOG_FORMAT") {
            let parsed = LogFormat::from_str(&format).map_err(|e| ConfigError::Invalid {
                key: "REGISTRY_LOG_FORMAT",
                value: format.clone(),
                reason: e.to_string(),
            })?;
            tracing = tracing.with_format(parsed);
        }

        Ok(Self {
            database,
            lease,
            scheduler,
            a2_import,
            tracing,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<bool>, ConfigError> {
    lookup(key)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: value.clone(),
                reason: "expected a boolean".to_string(),
            }),
        })
        .transpose()
}
