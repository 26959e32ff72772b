//! In-memory workflow store implementation for the Millrace engine
//!
//! This crate provides in-memory implementations of the store traits
//! defined in millrace-core. It is useful for embedding, development, and
//! testing, and it implements the full store contract: the atomic
//! lock-if-unlocked primitive, partial-update flushes driven by the
//! instance's dirty tracking, and the append-only archive of ended
//! activity instances.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Store implementations
pub mod stores;

pub use stores::{InMemoryWorkflowInstanceStore, InMemoryWorkflowStore};
