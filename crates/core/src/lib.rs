//! `registry-core`: shared building blocks for the party registry.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! typed identifiers, their validation errors and the clock abstraction used
//! by everything that reasons about expiry.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{ImportJobId, LeaseId};
