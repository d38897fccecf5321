//! capsched control plane library.
//!
//! Postgres persistence and serialized placement on top of
//! `capsched-capacity`. The crate ships the `capsched` admin binary; the
//! library surface exists for integration tests.

pub mod config;
pub mod db;
pub mod scheduler;
