//! Data Model - Immutable value types for desired and observed state
//!
//! `Deployment` is the desired configuration handed to the agent by the
//! configuration layer; `NodeState` and `ClusterState` are what the agents
//! observe. None of these types are mutated in place: every transition
//! builds a new value.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Smallest maximum size accepted for a dataset (64 MiB)
pub const MINIMUM_DATASET_SIZE: u64 = 64 * 1024 * 1024;

/// Length of a dataset identifier in its textual form
pub const DATASET_ID_LENGTH: usize = 36;

// =============================================================================
// Dataset ID
// =============================================================================

/// Identifier of a dataset (canonically a UUID in its 36-character form)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DatasetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DatasetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<uuid::Uuid> for DatasetId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.to_string())
    }
}

// =============================================================================
// Dataset / Manifestation
// =============================================================================

/// A unit of data with a size quota and a deletion intent flag
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: DatasetId,
    /// Maximum size in bytes, if bounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_size: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Tombstone: the dataset should be destroyed wherever it exists
    #[serde(default)]
    pub deleted: bool,
}

impl Dataset {
    pub fn new(dataset_id: impl Into<DatasetId>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            maximum_size: None,
            metadata: BTreeMap::new(),
            deleted: false,
        }
    }

    pub fn with_maximum_size(mut self, maximum_size: u64) -> Self {
        self.maximum_size = Some(maximum_size);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The same dataset marked for deletion
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }
}

/// A dataset realized on a specific node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Manifestation {
    pub dataset: Dataset,
    pub primary: bool,
}

impl Manifestation {
    pub fn primary(dataset: Dataset) -> Self {
        Self {
            dataset,
            primary: true,
        }
    }

    pub fn replica(dataset: Dataset) -> Self {
        Self {
            dataset,
            primary: false,
        }
    }

    #[inline]
    pub fn dataset_id(&self) -> &DatasetId {
        &self.dataset.dataset_id
    }
}

fn find_primary<'a>(
    manifestations: &'a BTreeSet<Manifestation>,
    dataset_id: &DatasetId,
) -> Option<&'a Manifestation> {
    manifestations
        .iter()
        .find(|m| m.primary && m.dataset_id() == dataset_id)
}

// =============================================================================
// Desired Configuration
// =============================================================================

/// Desired configuration of a single node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    #[serde(default)]
    pub manifestations: BTreeSet<Manifestation>,
}

impl Node {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            manifestations: BTreeSet::new(),
        }
    }

    pub fn with_manifestation(mut self, manifestation: Manifestation) -> Self {
        self.manifestations.insert(manifestation);
        self
    }

    pub fn with_primary(self, dataset: Dataset) -> Self {
        self.with_manifestation(Manifestation::primary(dataset))
    }

    /// The primary manifestation of a dataset on this node, if any
    pub fn primary(&self, dataset_id: &DatasetId) -> Option<&Manifestation> {
        find_primary(&self.manifestations, dataset_id)
    }

    pub fn primaries(&self) -> impl Iterator<Item = &Manifestation> {
        self.manifestations.iter().filter(|m| m.primary)
    }
}

/// The complete desired cluster configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub nodes: BTreeSet<Node>,
}

impl Deployment {
    /// Build a deployment, rejecting any dataset that is primary on two nodes
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Result<Self> {
        let deployment = Self {
            nodes: nodes.into_iter().collect(),
        };
        deployment.check_single_primary()?;
        Ok(deployment)
    }

    /// Desired configuration of one node
    pub fn node(&self, hostname: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.hostname == hostname)
    }

    /// Host that should hold the primary manifestation of a dataset
    pub fn primary_host(&self, dataset_id: &DatasetId) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.primary(dataset_id).is_some())
            .map(|n| n.hostname.as_str())
    }

    /// The configured dataset with the given id, wherever it is placed
    pub fn dataset(&self, dataset_id: &DatasetId) -> Option<&Dataset> {
        self.nodes
            .iter()
            .flat_map(|n| n.manifestations.iter())
            .map(|m| &m.dataset)
            .find(|d| &d.dataset_id == dataset_id)
    }

    /// A new deployment with the given node's configuration replaced
    pub fn with_node(&self, node: Node) -> Self {
        let mut nodes: BTreeSet<Node> = self
            .nodes
            .iter()
            .filter(|n| n.hostname != node.hostname)
            .cloned()
            .collect();
        nodes.insert(node);
        Self { nodes }
    }

    /// Verify that every dataset is primary on at most one node
    pub fn check_single_primary(&self) -> Result<()> {
        let mut owners: BTreeMap<&DatasetId, Vec<String>> = BTreeMap::new();
        for node in &self.nodes {
            for m in node.primaries() {
                owners
                    .entry(m.dataset_id())
                    .or_default()
                    .push(node.hostname.clone());
            }
        }

        match owners.into_iter().find(|(_, hosts)| hosts.len() > 1) {
            Some((dataset_id, hosts)) => Err(Error::DuplicatePrimary {
                dataset_id: dataset_id.to_string(),
                hosts,
            }),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Observed State
// =============================================================================

/// Observed state of a single node, as reported by its deployer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeState {
    pub hostname: String,
    #[serde(default)]
    pub running: BTreeSet<String>,
    #[serde(default)]
    pub not_running: BTreeSet<String>,
    #[serde(default)]
    pub manifestations: BTreeSet<Manifestation>,
}

impl NodeState {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            running: BTreeSet::new(),
            not_running: BTreeSet::new(),
            manifestations: BTreeSet::new(),
        }
    }

    pub fn with_manifestations(mut self, manifestations: impl IntoIterator<Item = Manifestation>) -> Self {
        self.manifestations = manifestations.into_iter().collect();
        self
    }

    pub fn primary(&self, dataset_id: &DatasetId) -> Option<&Manifestation> {
        find_primary(&self.manifestations, dataset_id)
    }

    /// Drop the given dataset from this node's reported manifestations
    pub fn without_dataset(&self, dataset_id: &DatasetId) -> Self {
        let mut state = self.clone();
        state.manifestations.retain(|m| m.dataset_id() != dataset_id);
        state
    }
}

/// Aggregated observed state across all nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterState {
    /// Node states keyed by hostname
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeState>,
    /// Datasets whose volumes exist but are attached to no node
    #[serde(default)]
    pub nonmanifest_datasets: BTreeMap<DatasetId, Dataset>,
}

impl ClusterState {
    pub fn new(nodes: impl IntoIterator<Item = NodeState>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|state| (state.hostname.clone(), state))
                .collect(),
            nonmanifest_datasets: BTreeMap::new(),
        }
    }

    pub fn node_state(&self, hostname: &str) -> Option<&NodeState> {
        self.nodes.get(hostname)
    }

    /// A new cluster state with one node's report replaced
    pub fn with_node_state(&self, state: NodeState) -> Self {
        let mut next = self.clone();
        next.nodes.insert(state.hostname.clone(), state);
        next
    }

    pub fn with_nonmanifest_datasets(mut self, datasets: impl IntoIterator<Item = Dataset>) -> Self {
        self.nonmanifest_datasets = datasets
            .into_iter()
            .map(|d| (d.dataset_id.clone(), d))
            .collect();
        self
    }

    /// Hosts currently reporting a primary manifestation of the dataset
    pub fn primary_hosts(&self, dataset_id: &DatasetId) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|state| state.primary(dataset_id).is_some())
            .map(|state| state.hostname.as_str())
            .collect()
    }
}
