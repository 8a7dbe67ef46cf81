//! Distributed leases: at most one holder per lease name across all hosts.

pub mod in_memory;
pub mod manager;
pub mod owned;
pub mod postgres;
pub mod provider;
pub mod types;

pub use in_memory::InMemoryLeaseProvider;
pub use manager::{Lease, LeaseManager};
pub use owned::OwnedLease;
pub use postgres::PostgresLeaseProvider;
pub use provider::LeaseProvider;
pub use types::{
    LeaseAcquireResult, LeaseError, LeaseFilter, LeaseHistory, LeaseInfo, LeaseReleaseResult,
    LeaseTicket, MAX_LEASE_DURATION,
};
