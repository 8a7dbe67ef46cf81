//! Party registry: commands produced by the legacy-system imports.
//!
//! Party records themselves (people, organizations) are owned by the API
//! layer. This crate only defines the identifiers and command payloads that
//! import jobs put on the bus and that party consumers handle.

pub mod a2_user;

pub use a2_user::{A2UserId, ImportA2UserParty};
