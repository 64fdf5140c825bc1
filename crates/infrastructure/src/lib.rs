//! Postgres-backed implementations of the repository and port traits.

pub mod cluster_lock;
pub mod database;
pub mod node;
pub mod search;
pub mod stats;
