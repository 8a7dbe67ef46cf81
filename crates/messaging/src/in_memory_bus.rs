//! In-memory command bus for tests/dev.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::bus::{BusError, CommandBus};
use crate::envelope::CommandEnvelope;

/// In-memory command bus.
///
/// - Records every accepted command (for assertions)
/// - Best-effort fan-out to subscribers
/// - Can be told to fail upcoming sends (transport outage simulation)
#[derive(Debug, Default)]
pub struct InMemoryCommandBus {
    sent: Mutex<Vec<CommandEnvelope<JsonValue>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CommandEnvelope<JsonValue>>>>,
    failures_pending: Mutex<u32>,
}

impl InMemoryCommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive a copy of every command accepted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CommandEnvelope<JsonValue>> {
        let (tx, rx) = mpsc::unbounded_channel();

        // A poisoned lock still yields a receiver; it just never sees messages.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        rx
    }

    /// Make the next `count` sends fail with a transport error.
    pub fn fail_next_sends(&self, count: u32) {
        if let Ok(mut pending) = self.failures_pending.lock() {
            *pending = count;
        }
    }

    /// All commands accepted so far, in send order.
    pub fn sent(&self) -> Vec<CommandEnvelope<JsonValue>> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CommandBus for InMemoryCommandBus {
    async fn send(&self, command: CommandEnvelope<JsonValue>) -> Result<(), BusError> {
        {
            let mut pending = self.failures_pending.lock().map_err(|_| poisoned())?;
            if *pending > 0 {
                *pending -= 1;
                return Err(BusError::Transport("injected failure".to_string()));
            }
        }

        {
            let mut subs = self.subscribers.lock().map_err(|_| poisoned())?;

            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(command.clone()).is_ok());
        }

        self.sent.lock().map_err(|_| poisoned())?.push(command);
        Ok(())
    }
}

fn poisoned() -> BusError {
    BusError::Transport("in-memory bus lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn envelope(key: &str) -> CommandEnvelope<JsonValue> {
        CommandEnvelope::new(Uuid::now_v7(), "test.cmd", key, serde_json::json!({}))
    }

    #[tokio::test]
    async fn records_and_fans_out() {
        let bus = InMemoryCommandBus::new();
        let mut rx = bus.subscribe();

        bus.send_batch(vec![envelope("a"), envelope("b")]).await.unwrap();

        assert_eq!(bus.sent_count(), 2);
        assert_eq!(rx.recv().await.unwrap().idempotency_key(), "a");
        assert_eq!(rx.recv().await.unwrap().idempotency_key(), "b");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let bus = InMemoryCommandBus::new();
        bus.fail_next_sends(1);

        assert!(matches!(bus.send(envelope("a")).await, Err(BusError::Transport(_))));
        bus.send(envelope("b")).await.unwrap();

        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].idempotency_key(), "b");
    }
}
