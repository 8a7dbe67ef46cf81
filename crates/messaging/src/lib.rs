//! Command boundary between import jobs and the message bus.
//!
//! The bus transport (retries, outbox, broker) is an external collaborator.
//! Producers only need a way to *send* commands; consumers only need a way to
//! *handle* them. Both sides are expressed here as small async traits plus an
//! in-memory implementation for tests/dev.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{BusError, CommandBus};
pub use command::Command;
pub use envelope::CommandEnvelope;
pub use handler::{CommandHandler, HandlerError};
pub use in_memory_bus::InMemoryCommandBus;
