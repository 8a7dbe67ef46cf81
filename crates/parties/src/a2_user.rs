use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use registry_core::DomainError;
use registry_messaging::Command;

/// User identifier in the legacy A2 system.
///
/// A2 allocates these from a dense, increasing sequence, which is what lets
/// the import use the id itself as its watermark position.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct A2UserId(u64);

impl A2UserId {
    pub fn new(value: u64) -> Result<Self, DomainError> {
        if value == 0 {
            return Err(DomainError::ZeroId { kind: "A2UserId" });
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for A2UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "a2-user:{}", self.0)
    }
}

/// Command: create or refresh the party mirrored from one A2 user.
///
/// Consumers upsert by `user_id`, so a redelivery (or a re-send after a
/// crashed import run) only repeats the same write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportA2UserParty {
    pub import_job: String,
    pub user_id: A2UserId,
    pub enqueued_at: DateTime<Utc>,
}

impl ImportA2UserParty {
    pub fn new(import_job: impl Into<String>, user_id: A2UserId, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            import_job: import_job.into(),
            user_id,
            enqueued_at,
        }
    }

    /// Watermark position this command accounts for once processed.
    pub fn position(&self) -> u64 {
        self.user_id.value()
    }
}

impl Command for ImportA2UserParty {
    const COMMAND_TYPE: &'static str = "parties.import_a2_user";

    // The enqueue timestamp is deliberately left out: re-sends of the same
    // user must collapse onto one key.
    fn idempotency_key(&self) -> String {
        format!("{}:{}", self.import_job, self.user_id)
    }
}
