//!
//! Domain model: workflow definitions, the runtime instance tree, and the
//! persistence and observation ports

/// Workflow cache trait and shared in-memory implementation
pub mod cache;

/// Lifecycle event listener trait and listener set
pub mod events;

/// Store traits and query types
pub mod repository;

/// Immutable workflow definition model
pub mod workflow;

/// Mutable runtime instance tree
pub mod workflow_instance;
