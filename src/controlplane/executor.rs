//! Action Executor
//!
//! Runs the actions of one convergence pass. Actions for different datasets
//! run as independent tasks, bounded by a semaphore; actions for the same
//! dataset are serialized through a keyed mutex. Transient failures are
//! retried with exponential backoff up to an attempt ceiling. A failed
//! action never aborts its siblings and nothing is rolled back.

use crate::controlplane::actions::Action;
use crate::controlplane::metrics::AgentMetrics;
use crate::domain::model::DatasetId;
use crate::domain::ports::BlockDeviceApiRef;
use crate::error::{Error, Result};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

// =============================================================================
// Executor Configuration
// =============================================================================

/// Configuration for the action executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Attempts per action, including the first
    pub max_attempts: u32,
    /// First retry delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Ceiling on the retry delay in milliseconds
    pub max_backoff_ms: u64,
    /// Actions running at the same time
    pub max_concurrent_actions: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_concurrent_actions: 16,
        }
    }
}

impl ExecutorConfig {
    fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.max_backoff_ms))
            .with_max_elapsed_time(None)
            .build()
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of running one action
#[derive(Debug)]
pub struct ActionOutcome {
    pub action: Action,
    /// Attempts made, including the first
    pub attempts: u32,
    /// The final error, if the action failed
    pub error: Option<Error>,
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-action outcomes of one convergence pass
#[derive(Debug, Default)]
pub struct PassReport {
    pub outcomes: Vec<ActionOutcome>,
}

impl PassReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// True if every action succeeded
    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }
}

// =============================================================================
// Action Executor
// =============================================================================

/// Applies actions to the backend on behalf of one node
pub struct ActionExecutor {
    config: ExecutorConfig,
    hostname: String,
    backend: BlockDeviceApiRef,
    /// In-flight guard per dataset
    locks: DashMap<DatasetId, Arc<Mutex<()>>>,
    permits: Semaphore,
    metrics: Option<AgentMetrics>,
}

impl ActionExecutor {
    pub fn new(hostname: impl Into<String>, backend: BlockDeviceApiRef, config: ExecutorConfig) -> Arc<Self> {
        Self::build(hostname.into(), backend, config, None)
    }

    pub fn with_metrics(
        hostname: impl Into<String>,
        backend: BlockDeviceApiRef,
        config: ExecutorConfig,
        metrics: AgentMetrics,
    ) -> Arc<Self> {
        Self::build(hostname.into(), backend, config, Some(metrics))
    }

    fn build(
        hostname: String,
        backend: BlockDeviceApiRef,
        config: ExecutorConfig,
        metrics: Option<AgentMetrics>,
    ) -> Arc<Self> {
        let permits = Semaphore::new(config.max_concurrent_actions.max(1));
        Arc::new(Self {
            config,
            hostname,
            backend,
            locks: DashMap::new(),
            permits,
            metrics,
        })
    }

    /// Run every action and report each outcome
    pub async fn execute(self: &Arc<Self>, actions: Vec<Action>) -> PassReport {
        if actions.is_empty() {
            return PassReport::default();
        }

        let (actions, handles): (Vec<_>, Vec<_>) = actions
            .into_iter()
            .map(|action| {
                let this = Arc::clone(self);
                let task_action = action.clone();
                let handle = tokio::spawn(async move { this.run_action(task_action).await });
                (action, handle)
            })
            .unzip();

        let mut report = PassReport::default();
        for (action, joined) in actions.into_iter().zip(join_all(handles).await) {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => ActionOutcome {
                    action,
                    attempts: 1,
                    error: Some(Error::Internal(format!("action task failed: {}", e))),
                },
            };
            report.outcomes.push(outcome);
        }

        info!(
            host = %self.hostname,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Executed convergence actions"
        );
        report
    }

    /// Run one action under its dataset lock, retrying transient failures
    pub async fn run_action(&self, action: Action) -> ActionOutcome {
        let lock = self.lock_for(action.dataset_id());
        let guard = lock.lock().await;

        let (attempts, result) = match self.permits.acquire().await {
            Ok(_permit) => self.run_with_retry(&action).await,
            Err(_) => (0, Err(Error::Internal("executor shut down".into()))),
        };

        drop(guard);
        drop(lock);
        self.locks
            .remove_if(action.dataset_id(), |_, lock| Arc::strong_count(lock) == 1);

        match &result {
            Ok(()) => debug!(action = %action, attempts, "Action succeeded"),
            Err(e) => warn!(action = %action, attempts, error = %e, "Action failed"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_action(action.kind(), result.is_ok());
        }

        ActionOutcome {
            action,
            attempts,
            error: result.err(),
        }
    }

    async fn run_with_retry(&self, action: &Action) -> (u32, Result<()>) {
        let max_attempts = self.config.max_attempts.max(1);
        let attempts = AtomicU32::new(0);

        let op = || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            action
                .run(self.backend.as_ref(), &self.hostname)
                .await
                .map_err(|e| {
                    if e.is_transient() && attempt < max_attempts {
                        debug!(action = %action, attempt, error = %e, "Retrying transient failure");
                        if let Some(metrics) = &self.metrics {
                            metrics.action_retries_total.inc();
                        }
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
        };

        let result = backoff::future::retry(self.config.backoff(), op).await;
        let attempts = attempts.load(Ordering::SeqCst);

        let result = result.map_err(|e| {
            if e.is_transient() {
                Error::ActionFailed {
                    dataset_id: action.dataset_id().to_string(),
                    attempts,
                    reason: e.to_string(),
                }
            } else {
                e
            }
        });
        (attempts, result)
    }

    fn lock_for(&self, dataset_id: &DatasetId) -> Arc<Mutex<()>> {
        self.locks
            .entry(dataset_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Datasets with an action queued or running
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{LoopbackBlockDeviceApi, MemoryBlockDeviceApi};
    use crate::domain::model::Dataset;
    use crate::domain::ports::{BlockDeviceApi, BlockDeviceVolume};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    const HOST: &str = "192.0.2.1";

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            max_concurrent_actions: 4,
        }
    }

    /// Memory backend whose listing is unavailable for the first N calls
    struct FlakyBackend {
        inner: MemoryBlockDeviceApi,
        failures_left: AtomicUsize,
        list_calls: AtomicUsize,
    }

    impl FlakyBackend {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryBlockDeviceApi::new(),
                failures_left: AtomicUsize::new(failures),
                list_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BlockDeviceApi for FlakyBackend {
        fn backend_name(&self) -> &str {
            "flaky"
        }

        async fn create_volume(&self, dataset_id: &DatasetId, size: u64) -> Result<BlockDeviceVolume> {
            self.inner.create_volume(dataset_id, size).await
        }

        async fn destroy_volume(&self, blockdevice_id: &str) -> Result<()> {
            self.inner.destroy_volume(blockdevice_id).await
        }

        async fn attach_volume(&self, blockdevice_id: &str, host: &str) -> Result<BlockDeviceVolume> {
            self.inner.attach_volume(blockdevice_id, host).await
        }

        async fn detach_volume(&self, blockdevice_id: &str) -> Result<()> {
            self.inner.detach_volume(blockdevice_id).await
        }

        async fn resize_volume(&self, blockdevice_id: &str, size: u64) -> Result<BlockDeviceVolume> {
            self.inner.resize_volume(blockdevice_id, size).await
        }

        async fn list_volumes(&self) -> Result<Vec<BlockDeviceVolume>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::BackendUnavailable {
                    backend: "flaky".into(),
                });
            }
            self.inner.list_volumes().await
        }

        async fn get_device_path(&self, blockdevice_id: &str) -> Result<PathBuf> {
            self.inner.get_device_path(blockdevice_id).await
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn create(dataset_id: &DatasetId) -> Action {
        Action::CreateDataset {
            dataset: Dataset::new(dataset_id.clone()),
            size: 1234,
        }
    }

    #[tokio::test]
    async fn test_execute_empty_pass() {
        let executor = ActionExecutor::new(HOST, Arc::new(MemoryBlockDeviceApi::new()), fast_config());
        let report = executor.execute(Vec::new()).await;
        assert!(report.outcomes.is_empty());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let backend = Arc::new(FlakyBackend::new(2));
        let executor = ActionExecutor::new(HOST, backend.clone(), fast_config());

        let report = executor.execute(vec![create(&DatasetId::generate())]).await;
        assert!(report.is_clean());
        assert_eq!(report.outcomes[0].attempts, 3);
        assert_eq!(backend.inner.list_volumes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_bounded_by_max_attempts() {
        let backend = Arc::new(FlakyBackend::new(100));
        let executor = ActionExecutor::new(HOST, backend.clone(), fast_config());

        let report = executor.execute(vec![create(&DatasetId::generate())]).await;
        assert_eq!(report.failed(), 1);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.attempts, 3);
        assert_matches!(outcome.error, Some(Error::ActionFailed { attempts: 3, .. }));
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_structural_failure_not_retried() {
        let backend = Arc::new(MemoryBlockDeviceApi::new());
        let executor = ActionExecutor::new(HOST, backend, fast_config());

        let report = executor
            .execute(vec![Action::AttachVolume {
                dataset_id: DatasetId::generate(),
            }])
            .await;
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.attempts, 1);
        assert_matches!(outcome.error, Some(Error::UnknownVolume { .. }));
    }

    #[tokio::test]
    async fn test_failure_isolated_from_siblings() {
        let backend = Arc::new(MemoryBlockDeviceApi::new());
        let executor = ActionExecutor::new(HOST, backend.clone(), fast_config());

        let good = DatasetId::generate();
        let report = executor
            .execute(vec![
                Action::AttachVolume {
                    dataset_id: DatasetId::generate(),
                },
                create(&good),
            ])
            .await;

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert!(backend.find_dataset_volume(&good).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_same_dataset_serialized() {
        let backend = Arc::new(MemoryBlockDeviceApi::new());
        let executor = ActionExecutor::new(HOST, backend.clone(), fast_config());
        let dataset_id = DatasetId::generate();

        // Without serialization both creates could allocate a volume
        let report = executor
            .execute(vec![create(&dataset_id), create(&dataset_id), create(&dataset_id)])
            .await;

        assert!(report.is_clean());
        assert_eq!(backend.list_volumes().await.unwrap().len(), 1);
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unrelated_creates_on_loopback() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(LoopbackBlockDeviceApi::from_path(tmp.path()).await.unwrap());
        let config = ExecutorConfig {
            max_concurrent_actions: 16,
            ..fast_config()
        };
        let executor = ActionExecutor::new(HOST, backend.clone(), config);

        for _ in 0..5 {
            let actions: Vec<_> = (0..32).map(|_| create(&DatasetId::generate())).collect();
            let report = executor.execute(actions).await;
            let errors: Vec<_> = report.failures().map(|o| o.error.as_ref().map(Error::to_string)).collect();
            assert!(report.is_clean(), "failed actions: {:?}", errors);
        }

        let volumes = backend.list_volumes().await.unwrap();
        assert_eq!(volumes.len(), 5 * 32);
        assert!(volumes.iter().all(|v| v.is_attached_to(HOST)));
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let registry = prometheus::Registry::new();
        let metrics = AgentMetrics::new(&registry).unwrap();
        let backend = Arc::new(FlakyBackend::new(1));
        let executor = ActionExecutor::with_metrics(HOST, backend, fast_config(), metrics.clone());

        executor.execute(vec![create(&DatasetId::generate())]).await;

        assert_eq!(metrics.action_retries_total.get(), 1);
        assert_eq!(
            metrics
                .actions_total
                .with_label_values(&["create_dataset", "success"])
                .get(),
            1
        );
    }
}
