//! Convergence Loop - the per-node control loop
//!
//! Each pass:
//! - discovers local state from the backend and reports it
//! - merges all reports into the cluster state
//! - computes actions against the desired configuration
//! - executes them and reports the resulting state
//!
//! Passes run one at a time, triggered by a configuration change or a
//! periodic tick. A failed pass is logged and the loop keeps going.

use crate::config::AgentConfig;
use crate::controlplane::cluster_state::ClusterStateService;
use crate::controlplane::deployer::Deployer;
use crate::controlplane::executor::{ActionExecutor, PassReport};
use crate::controlplane::metrics::AgentMetrics;
use crate::domain::ports::{BlockDeviceApiRef, ConfigurationStoreRef};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Pass Summary
// =============================================================================

/// What the most recent pass did, for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub finished_at: DateTime<Utc>,
    pub actions: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Set when the pass could not run at all
    pub error: Option<String>,
}

impl PassSummary {
    fn from_report(report: &PassReport) -> Self {
        Self {
            finished_at: Utc::now(),
            actions: report.outcomes.len(),
            succeeded: report.succeeded(),
            failed: report.failed(),
            error: None,
        }
    }

    fn from_error(e: &Error) -> Self {
        Self {
            finished_at: Utc::now(),
            actions: 0,
            succeeded: 0,
            failed: 0,
            error: Some(e.to_string()),
        }
    }
}

// =============================================================================
// Convergence Loop
// =============================================================================

/// Drives one node towards the desired configuration
pub struct ConvergenceLoop {
    config: AgentConfig,
    backend: BlockDeviceApiRef,
    deployer: Deployer,
    executor: Arc<ActionExecutor>,
    cluster_state: Arc<ClusterStateService>,
    config_store: ConfigurationStoreRef,
    metrics: Option<AgentMetrics>,
    last_pass: RwLock<Option<PassSummary>>,
}

impl ConvergenceLoop {
    /// Create a new convergence loop
    pub fn new(
        config: AgentConfig,
        backend: BlockDeviceApiRef,
        config_store: ConfigurationStoreRef,
        cluster_state: Arc<ClusterStateService>,
        metrics: Option<AgentMetrics>,
    ) -> Arc<Self> {
        let deployer = Deployer::new(config.hostname.clone(), backend.clone())
            .with_default_dataset_size(config.default_dataset_size);
        let executor = match &metrics {
            Some(metrics) => ActionExecutor::with_metrics(
                config.hostname.clone(),
                backend.clone(),
                config.executor.clone(),
                metrics.clone(),
            ),
            None => ActionExecutor::new(config.hostname.clone(), backend.clone(), config.executor.clone()),
        };

        Arc::new(Self {
            config,
            backend,
            deployer,
            executor,
            cluster_state,
            config_store,
            metrics,
            last_pass: RwLock::new(None),
        })
    }

    /// One-time setup before the first pass
    pub async fn initialize(&self) -> Result<()> {
        info!(
            host = %self.config.hostname,
            backend = self.backend.backend_name(),
            "Initializing convergence loop"
        );

        self.config.validate()?;
        self.backend.initialize().await?;

        if !self.backend.health_check().await? {
            return Err(Error::BackendUnavailable {
                backend: self.backend.backend_name().to_string(),
            });
        }

        let window = self.backend.consistency_window();
        if !window.is_zero() {
            info!(window = ?window, "Backend listings are eventually consistent");
        }

        Ok(())
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn cluster_state(&self) -> &Arc<ClusterStateService> {
        &self.cluster_state
    }

    /// Summary of the most recent pass
    pub async fn last_pass(&self) -> Option<PassSummary> {
        self.last_pass.read().await.clone()
    }

    /// Discover local state and publish it to the cluster state
    pub async fn report_local_state(&self) -> Result<()> {
        let local = self.deployer.discover().await?;
        self.cluster_state.update_node_state(local.node_state);
        self.cluster_state
            .update_nonmanifest_datasets(local.nonmanifest_datasets);
        Ok(())
    }

    /// Run one convergence pass
    pub async fn run_pass(&self) -> Result<PassReport> {
        let started = Instant::now();
        let result = self.converge().await;

        let summary = match &result {
            Ok(report) => PassSummary::from_report(report),
            Err(e) => PassSummary::from_error(e),
        };
        *self.last_pass.write().await = Some(summary);

        if let Some(metrics) = &self.metrics {
            let label = match &result {
                Ok(report) if report.is_clean() => "converged",
                Ok(_) => "partial",
                Err(_) => "error",
            };
            metrics.passes_total.with_label_values(&[label]).inc();
            metrics
                .pass_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }

        result
    }

    async fn converge(&self) -> Result<PassReport> {
        self.report_local_state().await?;

        if let Some(expiry) = self.config.node_expiry() {
            let expiry = chrono::Duration::from_std(expiry)
                .map_err(|e| Error::Configuration(format!("node expiry: {}", e)))?;
            let cutoff = Utc::now() - expiry;
            for host in self.cluster_state.expire_before(cutoff) {
                warn!(host = %host, "Expired stale node state");
            }
        }

        let desired = self.config_store.load().await?;
        let current = self.cluster_state.as_cluster_state();
        let actions = self.deployer.calculate_changes(&desired, &current);

        if actions.is_empty() {
            debug!(host = %self.config.hostname, "Already converged");
            return Ok(PassReport::default());
        }

        info!(
            host = %self.config.hostname,
            actions = actions.len(),
            "Applying convergence actions"
        );
        let report = self.executor.execute(actions).await;

        // Feed the result back so other nodes see it before the next tick
        self.report_local_state().await?;
        Ok(report)
    }

    /// Run passes until `shutdown` is cancelled
    ///
    /// The pass in progress when shutdown is requested runs to completion.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.convergence_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut changes = self.config_store.subscribe();
        let mut watching = true;

        info!(
            host = %self.config.hostname,
            interval = ?self.config.convergence_interval(),
            "Convergence loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                changed = changes.changed(), if watching => {
                    if changed.is_err() {
                        warn!("Configuration store closed; converging on the timer only");
                        watching = false;
                        continue;
                    }
                    debug!(generation = *changes.borrow(), "Configuration changed");
                }
            }

            match self.run_pass().await {
                Ok(report) if !report.is_clean() => {
                    for failure in report.failures() {
                        warn!(
                            action = %failure.action,
                            attempts = failure.attempts,
                            error = ?failure.error,
                            "Action left for the next pass"
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, kind = e.kind(), "Convergence pass failed"),
            }
        }

        info!(host = %self.config.hostname, "Convergence loop stopped");
    }
}
