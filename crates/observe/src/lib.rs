//! Observability plumbing shared by all crates in this workspace: a global
//! metrics registry and the tracing/logging initialization used by binaries
//! and tests.
pub mod metrics;
pub mod tracing;
