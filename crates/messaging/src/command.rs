use serde::Serialize;
use serde::de::DeserializeOwned;

/// A command sent over the bus (intent, not fact).
///
/// Delivery is **at-least-once**: the same command may reach a consumer more
/// than once, in any order relative to its batch siblings. The
/// `idempotency_key` is what lets consumers (and the bus, when it supports
/// de-duplication) recognise a redelivery.
pub trait Command: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable routing name (e.g. `parties.import_a2_user`).
    const COMMAND_TYPE: &'static str;

    /// Key identifying this unit of work across redeliveries and re-sends.
    fn idempotency_key(&self) -> String;
}
