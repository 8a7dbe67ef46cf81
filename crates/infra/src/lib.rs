//! Infrastructure layer: distributed leases, import watermarks, the
//! recurring job scheduler and the incremental import loop, with Postgres
//! and in-memory backends.

pub mod config;
pub mod db;
pub mod import;
pub mod import_jobs;
pub mod jobs;
pub mod leases;
pub mod retry;
pub mod services;

#[cfg(test)]
mod test_support;
