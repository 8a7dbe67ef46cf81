use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::bus::BusError;
use crate::envelope::CommandEnvelope;

/// Failure while handling a delivered command.
///
/// `Retryable` asks the transport to redeliver; `Rejected` is permanent (the
/// transport's dead-letter policy applies).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("retryable handler failure: {0}")]
    Retryable(String),

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Consumer side of the bus ("consume message" capability).
///
/// Implementations must be idempotent: the same envelope (same
/// `idempotency_key`) may be delivered more than once.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Command types this handler accepts.
    fn command_type(&self) -> &'static str;

    async fn handle(&self, envelope: &CommandEnvelope<JsonValue>) -> Result<(), HandlerError>;
}
