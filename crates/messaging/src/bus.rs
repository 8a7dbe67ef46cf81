//! Command sending abstraction (mechanics only).
//!
//! The bus is the **transport** between import jobs and the consumers that
//! apply imported records. It makes minimal assumptions:
//!
//! - **At-least-once delivery**: a command may arrive more than once; consumers
//!   must be idempotent.
//! - **No ordering guarantees** between commands of one batch once handed over.
//! - **No persistence promises** beyond "accepted": when `send` returns `Ok`,
//!   the transport has taken responsibility for delivery.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::envelope::CommandEnvelope;

/// Errors surfaced by a bus transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus transport rejected send: {0}")]
    Transport(String),

    #[error("bus is closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// "Send command" capability.
///
/// `send_batch` is all-or-error from the caller's point of view: on `Err`, some
/// prefix of the batch may still have been delivered, which is acceptable
/// under at-least-once semantics (the caller re-sends the whole batch).
#[async_trait]
pub trait CommandBus: Send + Sync {
    async fn send(&self, command: CommandEnvelope<JsonValue>) -> Result<(), BusError>;

    async fn send_batch(&self, commands: Vec<CommandEnvelope<JsonValue>>) -> Result<(), BusError> {
        for command in commands {
            self.send(command).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<B> CommandBus for Arc<B>
where
    B: CommandBus + ?Sized,
{
    async fn send(&self, command: CommandEnvelope<JsonValue>) -> Result<(), BusError> {
        (**self).send(command).await
    }

    async fn send_batch(&self, commands: Vec<CommandEnvelope<JsonValue>>) -> Result<(), BusError> {
        (**self).send_batch(commands).await
    }
}
