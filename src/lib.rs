//! Keeps a project's activity report current as its files change.
//!
//! A [sidecar::Sidecar] snapshots a project into a YAML report,
//! watches the project tree, and regenerates the report whenever
//! files change, logging each change to an append-only activity log.

pub mod config;
pub mod regen;
pub mod sidecar;
pub mod snapshot;
pub mod store;
pub mod watch;
