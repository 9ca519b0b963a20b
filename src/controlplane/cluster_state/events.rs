//! Cluster State Events
//!
//! Events emitted by the cluster state service for external consumers to
//! react to changes in observed state.

use serde::{Deserialize, Serialize};

/// Events emitted by the cluster state service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStateEvent {
    /// A node reported its state
    NodeStateUpdated { hostname: String, manifestations: usize },

    /// A node's report was dropped
    NodeRemoved { hostname: String },

    /// More than one node reports the same dataset as primary
    PrimaryConflict {
        dataset_id: String,
        hosts: Vec<String>,
        /// Host whose report wins, the most recently observed one
        resolved_to: String,
    },
}
