//! Prometheus metrics for the convergence agent

use crate::error::{Error, Result};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Counters and gauges updated by the executor and the convergence loop
#[derive(Clone)]
pub struct AgentMetrics {
    /// Actions finished, by kind and outcome
    pub actions_total: IntCounterVec,
    /// Retries of transient failures
    pub action_retries_total: IntCounter,
    /// Convergence passes, by result
    pub passes_total: IntCounterVec,
    pub pass_duration_seconds: Histogram,
    /// Datasets reported primary by more than one node
    pub primary_conflicts_total: IntCounter,
    /// Nodes with a current state report
    pub known_nodes: IntGauge,
}

impl AgentMetrics {
    /// Create the metrics and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self::unregistered()?;
        metrics.register(registry)?;
        Ok(metrics)
    }

    /// Create the metrics without registering them anywhere
    pub fn unregistered() -> Result<Self> {
        Ok(Self {
            actions_total: IntCounterVec::new(
                Opts::new("dataset_agent_actions_total", "Convergence actions executed"),
                &["kind", "outcome"],
            )
            .map_err(metrics_error)?,
            action_retries_total: IntCounter::new(
                "dataset_agent_action_retries_total",
                "Retries of transient action failures",
            )
            .map_err(metrics_error)?,
            passes_total: IntCounterVec::new(
                Opts::new("dataset_agent_passes_total", "Convergence passes run"),
                &["result"],
            )
            .map_err(metrics_error)?,
            pass_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                "dataset_agent_pass_duration_seconds",
                "Duration of a convergence pass",
            ))
            .map_err(metrics_error)?,
            primary_conflicts_total: IntCounter::new(
                "dataset_agent_primary_conflicts_total",
                "Datasets observed as primary on more than one node",
            )
            .map_err(metrics_error)?,
            known_nodes: IntGauge::new("dataset_agent_known_nodes", "Nodes with a state report")
                .map_err(metrics_error)?,
        })
    }

    fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.actions_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(self.action_retries_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(self.passes_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(self.pass_duration_seconds.clone())).map_err(metrics_error)?;
        registry.register(Box::new(self.primary_conflicts_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(self.known_nodes.clone())).map_err(metrics_error)?;
        Ok(())
    }

    pub fn record_action(&self, kind: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.actions_total.with_label_values(&[kind, outcome]).inc();
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        let registry = Registry::new();
        let metrics = AgentMetrics::new(&registry).unwrap();
        metrics.record_action("create_dataset", true);
        metrics.record_action("create_dataset", false);

        let families = registry.gather();
        let actions = families
            .iter()
            .find(|f| f.get_name() == "dataset_agent_actions_total")
            .unwrap();
        assert_eq!(actions.get_metric().len(), 2);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        AgentMetrics::new(&registry).unwrap();
        assert!(AgentMetrics::new(&registry).is_err());
    }
}
