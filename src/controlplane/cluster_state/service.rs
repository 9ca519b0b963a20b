//! Cluster State Service
//!
//! Holds the latest state report of each node. When two nodes both claim a
//! dataset as primary, the most recently observed report wins and the
//! conflict is logged and broadcast.

use super::ClusterStateEvent;
use crate::controlplane::metrics::AgentMetrics;
use crate::domain::model::{ClusterState, Dataset, DatasetId, NodeState};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// One node's report with the time it was observed
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub state: NodeState,
    pub observed_at: DateTime<Utc>,
    /// Arrival order; breaks ties between equal timestamps
    sequence: u64,
}

#[derive(Debug, Default)]
struct Reports {
    nodes: BTreeMap<String, NodeReport>,
    nonmanifest: BTreeMap<DatasetId, (Dataset, DateTime<Utc>, u64)>,
    next_sequence: u64,
}

impl Reports {
    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}

/// Aggregates per-node reports into a `ClusterState`
pub struct ClusterStateService {
    reports: RwLock<Reports>,
    event_sender: broadcast::Sender<ClusterStateEvent>,
    metrics: Option<AgentMetrics>,
}

impl ClusterStateService {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    pub fn with_metrics(metrics: AgentMetrics) -> Arc<Self> {
        Self::build(Some(metrics))
    }

    fn build(metrics: Option<AgentMetrics>) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(1024);
        Arc::new(Self {
            reports: RwLock::new(Reports::default()),
            event_sender,
            metrics,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterStateEvent> {
        self.event_sender.subscribe()
    }

    /// Record a node's state as observed now
    pub fn update_node_state(&self, state: NodeState) {
        self.update_node_state_at(state, Utc::now());
    }

    /// Record a node's state as observed at the given time
    pub fn update_node_state_at(&self, state: NodeState, observed_at: DateTime<Utc>) {
        let hostname = state.hostname.clone();
        let manifestations = state.manifestations.len();

        let conflicts = {
            let mut reports = self.reports.write();
            let sequence = reports.next_sequence();
            reports.nodes.insert(
                hostname.clone(),
                NodeReport {
                    state,
                    observed_at,
                    sequence,
                },
            );
            self.update_gauge(reports.nodes.len());
            conflicts_for(&reports, &hostname)
        };

        debug!(host = %hostname, manifestations, "Node state updated");
        let _ = self.event_sender.send(ClusterStateEvent::NodeStateUpdated {
            hostname,
            manifestations,
        });

        for (dataset_id, hosts, resolved_to) in conflicts {
            warn!(
                dataset_id = %dataset_id,
                hosts = ?hosts,
                resolved_to = %resolved_to,
                "Dataset reported primary on more than one node"
            );
            if let Some(metrics) = &self.metrics {
                metrics.primary_conflicts_total.inc();
            }
            let _ = self.event_sender.send(ClusterStateEvent::PrimaryConflict {
                dataset_id: dataset_id.to_string(),
                hosts,
                resolved_to,
            });
        }
    }

    /// Replace the set of datasets whose volumes are attached nowhere
    pub fn update_nonmanifest_datasets(&self, datasets: impl IntoIterator<Item = Dataset>) {
        let now = Utc::now();
        let mut reports = self.reports.write();
        let sequence = reports.next_sequence();
        reports.nonmanifest = datasets
            .into_iter()
            .map(|d| (d.dataset_id.clone(), (d, now, sequence)))
            .collect();
    }

    /// Drop a node's report
    pub fn remove_node(&self, hostname: &str) -> bool {
        let removed = {
            let mut reports = self.reports.write();
            let removed = reports.nodes.remove(hostname).is_some();
            self.update_gauge(reports.nodes.len());
            removed
        };

        if removed {
            info!(host = hostname, "Node state removed");
            let _ = self.event_sender.send(ClusterStateEvent::NodeRemoved {
                hostname: hostname.to_string(),
            });
        }
        removed
    }

    /// Drop reports observed before `cutoff`; returns the affected hosts
    pub fn expire_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .reports
            .read()
            .nodes
            .iter()
            .filter(|(_, report)| report.observed_at < cutoff)
            .map(|(hostname, _)| hostname.clone())
            .collect();

        stale.into_iter().filter(|host| self.remove_node(host)).collect()
    }

    /// Latest report of one node
    pub fn node_report(&self, hostname: &str) -> Option<NodeReport> {
        self.reports.read().nodes.get(hostname).cloned()
    }

    /// Merge all reports into a consistent cluster state
    ///
    /// Every dataset ends up primary on at most one node.
    pub fn as_cluster_state(&self) -> ClusterState {
        let reports = self.reports.read();

        // Most recent claim per dataset: (observed_at, sequence, host)
        let mut winners: BTreeMap<&DatasetId, (DateTime<Utc>, u64, &str)> = BTreeMap::new();
        for (hostname, report) in &reports.nodes {
            for m in report.state.manifestations.iter().filter(|m| m.primary) {
                let claim = (report.observed_at, report.sequence, hostname.as_str());
                winners
                    .entry(m.dataset_id())
                    .and_modify(|best| {
                        if (claim.0, claim.1) > (best.0, best.1) {
                            *best = claim;
                        }
                    })
                    .or_insert(claim);
            }
        }

        let nodes = reports.nodes.iter().map(|(hostname, report)| {
            let mut state = report.state.clone();
            state.manifestations.retain(|m| {
                !m.primary || winners.get(m.dataset_id()).map(|w| w.2) == Some(hostname.as_str())
            });
            state
        });

        // An unattached volume stays known unless a newer report shows it attached
        let nonmanifest = reports
            .nonmanifest
            .iter()
            .filter(|(id, (_, observed_at, sequence))| match winners.get(id) {
                Some((claimed_at, claim_sequence, _)) => {
                    (*observed_at, *sequence) > (*claimed_at, *claim_sequence)
                }
                None => true,
            })
            .map(|(_, (dataset, _, _))| dataset.clone());

        ClusterState::new(nodes).with_nonmanifest_datasets(nonmanifest)
    }

    fn update_gauge(&self, nodes: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.known_nodes.set(nodes as i64);
        }
    }
}

/// Datasets that `hostname` claims as primary and some other node does too
fn conflicts_for(reports: &Reports, hostname: &str) -> Vec<(DatasetId, Vec<String>, String)> {
    let Some(report) = reports.nodes.get(hostname) else {
        return Vec::new();
    };

    report
        .state
        .manifestations
        .iter()
        .filter(|m| m.primary)
        .filter_map(|m| {
            let mut claims: Vec<(&str, &NodeReport)> = reports
                .nodes
                .iter()
                .filter(|(_, r)| r.state.primary(m.dataset_id()).is_some())
                .map(|(h, r)| (h.as_str(), r))
                .collect();
            if claims.len() < 2 {
                return None;
            }
            claims.sort_by_key(|(_, r)| (r.observed_at, r.sequence));
            let resolved_to = claims.last().map(|(h, _)| h.to_string())?;
            let hosts = claims.iter().map(|(h, _)| h.to_string()).collect();
            Some((m.dataset_id().clone(), hosts, resolved_to))
        })
        .collect()
}
