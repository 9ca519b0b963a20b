//! Cluster State Aggregation
//!
//! Merges the state reports of every node into the cluster-wide observed
//! state that drives convergence.

pub mod events;
pub mod service;

pub use events::*;
pub use service::*;
