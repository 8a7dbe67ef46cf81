use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::bus::BusError;
use crate::command::Command;

/// Envelope for a command, carrying routing and de-duplication metadata.
///
/// Notes:
/// - `message_id` is unique per send attempt.
/// - `idempotency_key` is stable across re-sends of the same unit of work.
/// - `payload` is the serialized command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope<C = JsonValue> {
    message_id: Uuid,
    command_type: String,
    idempotency_key: String,
    payload: C,
}

impl<C> CommandEnvelope<C> {
    pub fn new(
        message_id: Uuid,
        command_type: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: C,
    ) -> Self {
        Self {
            message_id,
            command_type: command_type.into(),
            idempotency_key: idempotency_key.into(),
            payload,
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn payload(&self) -> &C {
        &self.payload
    }

    pub fn into_payload(self) -> C {
        self.payload
    }
}

impl CommandEnvelope<JsonValue> {
    /// Serialize a typed command into a transport envelope.
    pub fn from_command<C: Command>(command: &C) -> Result<Self, BusError> {
        let payload =
            serde_json::to_value(command).map_err(|e| BusError::Serialization(e.to_string()))?;
        Ok(Self::new(
            Uuid::now_v7(),
            C::COMMAND_TYPE,
            command.idempotency_key(),
            payload,
        ))
    }

    /// Deserialize the payload back into a typed command.
    ///
    /// Fails if the envelope was produced for a different command type.
    pub fn decode<C: Command>(&self) -> Result<C, BusError> {
        if self.command_type != C::COMMAND_TYPE {
            return Err(BusError::Deserialization(format!(
                "expected command type '{}', got '{}'",
                C::COMMAND_TYPE,
                self.command_type
            )));
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| BusError::Deserialization(e.to_string()))
    }
}
