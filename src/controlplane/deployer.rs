//! Deployer
//!
//! Per-node component that reads observed state from the block device
//! backend and computes the actions needed to reach the desired
//! configuration. It keeps no state of its own between passes, so a
//! restarted agent picks up exactly where the backend says it is.

use crate::controlplane::actions::Action;
use crate::domain::model::{ClusterState, Dataset, DatasetId, Deployment, Manifestation, NodeState};
use crate::domain::ports::{BlockDeviceApiRef, BlockDeviceVolume};
use crate::error::Result;
use std::collections::BTreeSet;
use tracing::{debug, instrument};

/// Default size of a dataset created without a maximum size (1 GiB)
pub const DEFAULT_DATASET_SIZE: u64 = 1024 * 1024 * 1024;

/// Observed state of this node in one backend listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalState {
    pub node_state: NodeState,
    /// Datasets whose volumes are attached nowhere
    pub nonmanifest_datasets: Vec<Dataset>,
}

/// Discovers local state and computes convergence actions for one node
pub struct Deployer {
    hostname: String,
    backend: BlockDeviceApiRef,
    default_dataset_size: u64,
}

impl Deployer {
    pub fn new(hostname: impl Into<String>, backend: BlockDeviceApiRef) -> Self {
        Self {
            hostname: hostname.into(),
            backend,
            default_dataset_size: DEFAULT_DATASET_SIZE,
        }
    }

    /// Size used for datasets that do not specify `maximum_size`
    pub fn with_default_dataset_size(mut self, size: u64) -> Self {
        self.default_dataset_size = size;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn backend(&self) -> &BlockDeviceApiRef {
        &self.backend
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Manifestations currently attached to this node
    pub async fn discover_local_state(&self) -> Result<NodeState> {
        Ok(self.discover().await?.node_state)
    }

    /// Datasets that exist in the backend but are attached to no node
    pub async fn discover_nonmanifest_datasets(&self) -> Result<Vec<Dataset>> {
        Ok(self.discover().await?.nonmanifest_datasets)
    }

    /// Both halves of the local view from a single listing
    pub async fn discover(&self) -> Result<LocalState> {
        let volumes = self.backend.list_volumes().await?;
        let state = self.partition(volumes);
        debug!(
            host = %self.hostname,
            manifestations = state.node_state.manifestations.len(),
            nonmanifest = state.nonmanifest_datasets.len(),
            "Discovered local state"
        );
        Ok(state)
    }

    fn partition(&self, volumes: Vec<BlockDeviceVolume>) -> LocalState {
        let mut manifestations = BTreeSet::new();
        let mut nonmanifest_datasets = Vec::new();

        for volume in volumes {
            let dataset = Dataset::new(volume.dataset_id.clone()).with_maximum_size(volume.size);
            match volume.host.as_deref() {
                Some(host) if host == self.hostname => {
                    manifestations.insert(Manifestation::primary(dataset));
                }
                Some(_) => {}
                None => nonmanifest_datasets.push(dataset),
            }
        }

        LocalState {
            node_state: NodeState::new(self.hostname.clone()).with_manifestations(manifestations),
            nonmanifest_datasets,
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Actions that move this node from `current` towards `desired`
    ///
    /// A pure function of its inputs; the result is ordered by dataset id.
    #[instrument(skip_all, fields(host = %self.hostname))]
    pub fn calculate_changes(&self, desired: &Deployment, current: &ClusterState) -> Vec<Action> {
        let wanted_here = desired.node(&self.hostname);
        let observed_here = current.node_state(&self.hostname);

        let dataset_ids: BTreeSet<&DatasetId> = wanted_here
            .into_iter()
            .flat_map(|node| node.primaries())
            .chain(observed_here.into_iter().flat_map(|state| {
                state.manifestations.iter().filter(|m| m.primary)
            }))
            .map(Manifestation::dataset_id)
            .collect();

        let mut actions = Vec::new();
        for dataset_id in dataset_ids {
            let wanted = wanted_here
                .and_then(|node| node.primary(dataset_id))
                .map(|m| &m.dataset);
            let observed = observed_here
                .and_then(|state| state.primary(dataset_id))
                .map(|m| &m.dataset);

            let action = match (wanted, observed) {
                (Some(wanted), None) => self.acquire(wanted, current),
                (Some(wanted), Some(observed)) => Self::maintain(wanted, observed),
                (None, Some(_)) => self.release(dataset_id, desired),
                (None, None) => None,
            };
            actions.extend(action);
        }

        debug!(count = actions.len(), "Calculated changes");
        actions
    }

    /// Wanted here but not attached here
    fn acquire(&self, wanted: &Dataset, current: &ClusterState) -> Option<Action> {
        if wanted.deleted {
            // A tombstoned dataset left unattached is destroyed by its configured node
            return current
                .nonmanifest_datasets
                .contains_key(&wanted.dataset_id)
                .then(|| Action::DestroyDataset {
                    dataset_id: wanted.dataset_id.clone(),
                });
        }

        let holder = current
            .primary_hosts(&wanted.dataset_id)
            .into_iter()
            .find(|host| *host != self.hostname);

        if let Some(from) = holder {
            return Some(Action::HandoffDataset {
                dataset_id: wanted.dataset_id.clone(),
                from: from.to_string(),
            });
        }

        if current.nonmanifest_datasets.contains_key(&wanted.dataset_id) {
            return Some(Action::AttachVolume {
                dataset_id: wanted.dataset_id.clone(),
            });
        }

        Some(Action::CreateDataset {
            dataset: wanted.clone(),
            size: wanted.maximum_size.unwrap_or(self.default_dataset_size),
        })
    }

    /// Wanted here and attached here
    fn maintain(wanted: &Dataset, observed: &Dataset) -> Option<Action> {
        if wanted.deleted {
            return Some(Action::DestroyDataset {
                dataset_id: wanted.dataset_id.clone(),
            });
        }

        match wanted.maximum_size {
            Some(size) if observed.maximum_size != Some(size) => Some(Action::ResizeVolume {
                dataset_id: wanted.dataset_id.clone(),
                size,
            }),
            _ => None,
        }
    }

    /// Attached here but not wanted here
    fn release(&self, dataset_id: &DatasetId, desired: &Deployment) -> Option<Action> {
        match desired.dataset(dataset_id) {
            Some(dataset) if dataset.deleted => Some(Action::DestroyDataset {
                dataset_id: dataset_id.clone(),
            }),
            Some(_) if desired.primary_host(dataset_id).is_some() => Some(Action::DetachVolume {
                dataset_id: dataset_id.clone(),
            }),
            _ => {
                debug!(dataset_id = %dataset_id, "Leaving unconfigured dataset in place");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{LoopbackBlockDeviceApi, MemoryBlockDeviceApi};
    use crate::domain::model::{Node, MINIMUM_DATASET_SIZE};
    use crate::domain::ports::BlockDeviceApi;
    use std::sync::Arc;
    use tempfile::TempDir;

    const HOST: &str = "192.0.2.1";
    const OTHER: &str = "192.0.2.2";

    fn memory_deployer(hostname: &str) -> (Deployer, Arc<MemoryBlockDeviceApi>) {
        let api = Arc::new(MemoryBlockDeviceApi::new());
        (Deployer::new(hostname, api.clone()), api)
    }

    async fn observe(deployer: &Deployer) -> ClusterState {
        let local = deployer.discover().await.unwrap();
        ClusterState::new([local.node_state]).with_nonmanifest_datasets(local.nonmanifest_datasets)
    }

    fn deployment(nodes: impl IntoIterator<Item = Node>) -> Deployment {
        Deployment::new(nodes).unwrap()
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    #[tokio::test]
    async fn test_discover_no_devices() {
        let tmp = TempDir::new().unwrap();
        let api = LoopbackBlockDeviceApi::from_path(tmp.path()).await.unwrap();
        let deployer = Deployer::new(HOST, Arc::new(api));

        assert_eq!(deployer.discover_local_state().await.unwrap(), NodeState::new(HOST));
    }

    #[tokio::test]
    async fn test_discover_one_device() {
        let tmp = TempDir::new().unwrap();
        let api = Arc::new(LoopbackBlockDeviceApi::from_path(tmp.path()).await.unwrap());
        let dataset_id = DatasetId::generate();
        let volume = api.create_volume(&dataset_id, 1234).await.unwrap();
        api.attach_volume(&volume.blockdevice_id, HOST).await.unwrap();

        let deployer = Deployer::new(HOST, api);
        let expected = NodeState::new(HOST).with_manifestations([Manifestation::primary(
            Dataset::new(dataset_id).with_maximum_size(1234),
        )]);
        assert_eq!(deployer.discover_local_state().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_discover_attached_elsewhere() {
        let (deployer, api) = memory_deployer(HOST);
        let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
        api.attach_volume(&volume.blockdevice_id, OTHER).await.unwrap();

        let state = deployer.discover().await.unwrap();
        assert_eq!(state.node_state, NodeState::new(HOST));
        assert!(state.nonmanifest_datasets.is_empty());
    }

    #[tokio::test]
    async fn test_discover_unattached() {
        let (deployer, api) = memory_deployer(HOST);
        let dataset_id = DatasetId::generate();
        api.create_volume(&dataset_id, 1234).await.unwrap();

        assert_eq!(deployer.discover_local_state().await.unwrap(), NodeState::new(HOST));
        assert_eq!(
            deployer.discover_nonmanifest_datasets().await.unwrap(),
            vec![Dataset::new(dataset_id).with_maximum_size(1234)]
        );
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    #[test]
    fn test_no_changes_when_converged() {
        let (deployer, _api) = memory_deployer(HOST);
        let dataset = Dataset::new(DatasetId::generate()).with_maximum_size(MINIMUM_DATASET_SIZE);

        let desired = deployment([Node::new(HOST).with_primary(dataset.clone())]);
        let current = ClusterState::new([
            NodeState::new(HOST).with_manifestations([Manifestation::primary(dataset)])
        ]);

        assert!(deployer.calculate_changes(&desired, &current).is_empty());
    }

    #[test]
    fn test_no_changes_when_nothing_anywhere() {
        let (deployer, _api) = memory_deployer(HOST);
        let changes = deployer.calculate_changes(&Deployment::default(), &ClusterState::default());
        assert!(changes.is_empty());
    }

    #[test]
    fn test_create_missing_dataset() {
        let (deployer, _api) = memory_deployer(HOST);
        let dataset = Dataset::new(DatasetId::generate());
        let desired = deployment([Node::new(HOST).with_primary(dataset.clone())]);

        let changes = deployer.calculate_changes(&desired, &ClusterState::default());
        assert_eq!(
            changes,
            vec![Action::CreateDataset {
                dataset,
                size: DEFAULT_DATASET_SIZE,
            }]
        );
    }

    #[test]
    fn test_create_uses_maximum_size() {
        let (deployer, _api) = memory_deployer(HOST);
        let deployer = deployer.with_default_dataset_size(MINIMUM_DATASET_SIZE);
        let sized = Dataset::new(DatasetId::generate()).with_maximum_size(2 * MINIMUM_DATASET_SIZE);
        let desired = deployment([Node::new(HOST).with_primary(sized.clone())]);

        assert_eq!(
            deployer.calculate_changes(&desired, &ClusterState::default()),
            vec![Action::CreateDataset {
                dataset: sized,
                size: 2 * MINIMUM_DATASET_SIZE,
            }]
        );
    }

    #[test]
    fn test_attach_known_nonmanifest_dataset() {
        let (deployer, _api) = memory_deployer(HOST);
        let dataset = Dataset::new(DatasetId::generate());
        let desired = deployment([Node::new(HOST).with_primary(dataset.clone())]);
        let current = ClusterState::default()
            .with_nonmanifest_datasets([dataset.clone().with_maximum_size(1234)]);

        assert_eq!(
            deployer.calculate_changes(&desired, &current),
            vec![Action::AttachVolume {
                dataset_id: dataset.dataset_id,
            }]
        );
    }

    #[test]
    fn test_handoff_both_sides() {
        let dataset = Dataset::new(DatasetId::generate());
        let desired = deployment([
            Node::new(HOST).with_primary(dataset.clone()),
            Node::new(OTHER),
        ]);
        let current = ClusterState::new([
            NodeState::new(HOST),
            NodeState::new(OTHER).with_manifestations([Manifestation::primary(dataset.clone())]),
        ]);

        let (receiver, _api) = memory_deployer(HOST);
        assert_eq!(
            receiver.calculate_changes(&desired, &current),
            vec![Action::HandoffDataset {
                dataset_id: dataset.dataset_id.clone(),
                from: OTHER.into(),
            }]
        );

        let (sender, _api) = memory_deployer(OTHER);
        assert_eq!(
            sender.calculate_changes(&desired, &current),
            vec![Action::DetachVolume {
                dataset_id: dataset.dataset_id,
            }]
        );
    }

    #[test]
    fn test_resize_on_new_maximum_size() {
        let (deployer, _api) = memory_deployer(HOST);
        let dataset_id = DatasetId::generate();
        let observed = Dataset::new(dataset_id.clone()).with_maximum_size(MINIMUM_DATASET_SIZE);
        let wanted = Dataset::new(dataset_id.clone()).with_maximum_size(2 * MINIMUM_DATASET_SIZE);

        let desired = deployment([Node::new(HOST).with_primary(wanted)]);
        let current = ClusterState::new([
            NodeState::new(HOST).with_manifestations([Manifestation::primary(observed)])
        ]);

        assert_eq!(
            deployer.calculate_changes(&desired, &current),
            vec![Action::ResizeVolume {
                dataset_id,
                size: 2 * MINIMUM_DATASET_SIZE,
            }]
        );
    }

    #[test]
    fn test_no_resize_without_maximum_size() {
        let (deployer, _api) = memory_deployer(HOST);
        let dataset_id = DatasetId::generate();
        let desired = deployment([Node::new(HOST).with_primary(Dataset::new(dataset_id.clone()))]);
        let current = ClusterState::new([NodeState::new(HOST).with_manifestations([
            Manifestation::primary(Dataset::new(dataset_id).with_maximum_size(1234)),
        ])]);

        assert!(deployer.calculate_changes(&desired, &current).is_empty());
    }

    #[test]
    fn test_destroy_deleted_dataset() {
        let (deployer, _api) = memory_deployer(HOST);
        let dataset = Dataset::new(DatasetId::generate());
        let desired = deployment([Node::new(HOST).with_primary(dataset.clone().deleted())]);
        let current = ClusterState::new([
            NodeState::new(HOST).with_manifestations([Manifestation::primary(dataset.clone())])
        ]);

        assert_eq!(
            deployer.calculate_changes(&desired, &current),
            vec![Action::DestroyDataset {
                dataset_id: dataset.dataset_id,
            }]
        );
    }

    #[test]
    fn test_destroy_deleted_dataset_configured_elsewhere() {
        let (deployer, _api) = memory_deployer(HOST);
        let dataset = Dataset::new(DatasetId::generate());
        let desired = deployment([Node::new(OTHER).with_primary(dataset.clone().deleted())]);
        let current = ClusterState::new([
            NodeState::new(HOST).with_manifestations([Manifestation::primary(dataset.clone())])
        ]);

        assert_eq!(
            deployer.calculate_changes(&desired, &current),
            vec![Action::DestroyDataset {
                dataset_id: dataset.dataset_id,
            }]
        );
    }

    #[test]
    fn test_deleted_and_absent_is_noop() {
        let (deployer, _api) = memory_deployer(HOST);
        let dataset = Dataset::new(DatasetId::generate()).deleted();
        let desired = deployment([Node::new(HOST).with_primary(dataset)]);

        assert!(deployer
            .calculate_changes(&desired, &ClusterState::default())
            .is_empty());
    }

    #[test]
    fn test_destroy_deleted_unattached_dataset() {
        let dataset = Dataset::new(DatasetId::generate());
        let desired = deployment([Node::new(HOST).with_primary(dataset.clone().deleted())]);
        let current = ClusterState::new([NodeState::new(HOST), NodeState::new(OTHER)])
            .with_nonmanifest_datasets([dataset.clone().with_maximum_size(1234)]);

        let (deployer, _api) = memory_deployer(HOST);
        assert_eq!(
            deployer.calculate_changes(&desired, &current),
            vec![Action::DestroyDataset {
                dataset_id: dataset.dataset_id,
            }]
        );

        // Only the configured node cleans it up
        let (other, _api) = memory_deployer(OTHER);
        assert!(other.calculate_changes(&desired, &current).is_empty());
    }

    #[tokio::test]
    async fn test_unattached_tombstone_destroyed_by_pass() {
        let (deployer, api) = memory_deployer(HOST);
        let dataset = Dataset::new(DatasetId::generate());
        api.create_volume(&dataset.dataset_id, 1234).await.unwrap();
        let desired = deployment([Node::new(HOST).with_primary(dataset.clone().deleted())]);

        for action in deployer.calculate_changes(&desired, &observe(&deployer).await) {
            action.run(api.as_ref(), HOST).await.unwrap();
        }

        assert!(api.list_volumes().await.unwrap().is_empty());
        assert!(deployer
            .calculate_changes(&desired, &observe(&deployer).await)
            .is_empty());
    }

    #[test]
    fn test_unconfigured_dataset_left_alone() {
        let (deployer, _api) = memory_deployer(HOST);
        let current = ClusterState::new([NodeState::new(HOST).with_manifestations([
            Manifestation::primary(Dataset::new(DatasetId::generate())),
        ])]);

        assert!(deployer
            .calculate_changes(&Deployment::default(), &current)
            .is_empty());
    }

    #[test]
    fn test_changes_sorted_by_dataset() {
        let (deployer, _api) = memory_deployer(HOST);
        let mut node = Node::new(HOST);
        for _ in 0..10 {
            node = node.with_primary(Dataset::new(DatasetId::generate()));
        }
        let changes = deployer.calculate_changes(&deployment([node]), &ClusterState::default());

        let ids: Vec<_> = changes.iter().map(|a| a.dataset_id().clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn test_one_pass_converges() {
        let (deployer, api) = memory_deployer(HOST);
        let keep = Dataset::new(DatasetId::generate()).with_maximum_size(MINIMUM_DATASET_SIZE);
        let grow = Dataset::new(DatasetId::generate()).with_maximum_size(MINIMUM_DATASET_SIZE);
        let doomed = Dataset::new(DatasetId::generate());

        for dataset in [&grow, &doomed] {
            let volume = api
                .create_volume(&dataset.dataset_id, MINIMUM_DATASET_SIZE)
                .await
                .unwrap();
            api.attach_volume(&volume.blockdevice_id, HOST).await.unwrap();
        }

        let desired = deployment([Node::new(HOST)
            .with_primary(keep.clone())
            .with_primary(grow.clone().with_maximum_size(2 * MINIMUM_DATASET_SIZE))
            .with_primary(doomed.clone().deleted())]);

        let actions = deployer.calculate_changes(&desired, &observe(&deployer).await);
        assert_eq!(actions.len(), 3);
        for action in &actions {
            action.run(api.as_ref(), HOST).await.unwrap();
        }

        assert!(deployer.calculate_changes(&desired, &observe(&deployer).await).is_empty());
        assert_eq!(api.list_volumes().await.unwrap().len(), 2);
    }
}
