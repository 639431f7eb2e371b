//! Integration and end-to-end tests for Hermyx.
//!
//! Test modules:
//!
//! - `mock_upstream`: a reusable in-process origin server with the classic
//!   probe endpoints (`/hello`, `/time`, `/delay`, `/echo`, `/exceed`).
//! - `pipeline_tests`: end-to-end scenarios through the full request
//!   pipeline — cache hits, rate-limit denials, per-key isolation, fallback
//!   behavior.
//! - `persistence_tests`: disk-cache state surviving an engine restart.
//!
//! Redis-dependent behavior (fail-open/fail-closed, namespacing) is covered
//! by unit tests in `hermyx-core` against an unreachable address; nothing
//! here requires a live Redis.
//!
//! Run with `cargo test --package tests`.

pub mod mock_upstream;

#[cfg(test)]
mod pipeline_tests;

#[cfg(test)]
mod persistence_tests;
