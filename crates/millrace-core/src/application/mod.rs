//!
//! Application services: engine operations, the work-queue execution loop,
//! and the bounded-backoff retry primitive

/// The workflow engine and its builder
pub mod engine;

/// Work-queue drain loop and per-state execution steps
pub mod executor;

/// Bounded-backoff retry
pub mod retry;
