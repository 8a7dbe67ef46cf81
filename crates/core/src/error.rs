//! Rejections raised while constructing registry values.
//!
//! Only caller input ends up here. Store and transport failures have their
//! own error types next to the adapters that produce them.

use thiserror::Error;

/// A lease name, import job name or upstream id was refused.
///
/// `kind` names the value type (`"LeaseId"`, `"A2UserId"`, ...) so a log
/// line says which input was wrong without carrying the input itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("{kind} must not be empty")]
    EmptyName { kind: &'static str },

    /// Names are stored as `TEXT` primary keys, so their length is capped.
    #[error("{kind} is {len} bytes, longer than the {max} allowed")]
    NameTooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },

    /// Upstream sequences start at 1; position 0 means "nothing imported yet".
    #[error("{kind} must be positive")]
    ZeroId { kind: &'static str },
}

impl DomainError {
    /// Value type that was rejected.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyName { kind } | Self::NameTooLong { kind, .. } | Self::ZeroId { kind } => kind,
        }
    }
}
