//! Agent Configuration
//!
//! Settings are assembled from defaults, an optional YAML file, and
//! command-line flags (which win). Sizes accept plain byte counts or
//! human-readable capacities such as `"64Mi"` or `"1G"`.

use crate::controlplane::backends::BackendConfig;
use crate::controlplane::executor::ExecutorConfig;
use crate::domain::model::MINIMUM_DATASET_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for one node's convergence agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identity of this node in the deployment
    pub hostname: String,
    pub backend: BackendConfig,
    pub executor: ExecutorConfig,
    /// Seconds between convergence passes when nothing changes
    pub convergence_interval_secs: u64,
    /// Size of datasets created without a maximum size
    #[serde(deserialize_with = "deserialize_capacity")]
    pub default_dataset_size: u64,
    /// Drop node reports older than this many seconds; 0 keeps them forever
    pub node_expiry_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            backend: BackendConfig::default(),
            executor: ExecutorConfig::default(),
            convergence_interval_secs: 10,
            default_dataset_size: 1024 * 1024 * 1024, // 1 GiB
            node_expiry_secs: 0,
        }
    }
}

impl AgentConfig {
    /// Parse a YAML document; missing keys keep their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml_str(&content)
    }

    pub fn convergence_interval(&self) -> Duration {
        Duration::from_secs(self.convergence_interval_secs)
    }

    pub fn node_expiry(&self) -> Option<Duration> {
        (self.node_expiry_secs > 0).then(|| Duration::from_secs(self.node_expiry_secs))
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(Error::Configuration("hostname must not be empty".into()));
        }
        if self.convergence_interval_secs == 0 {
            return Err(Error::Configuration("convergence interval must be positive".into()));
        }
        if self.default_dataset_size < MINIMUM_DATASET_SIZE {
            return Err(Error::Configuration(format!(
                "default dataset size {} is below the minimum of {} bytes",
                self.default_dataset_size, MINIMUM_DATASET_SIZE
            )));
        }
        if self.executor.max_attempts == 0 {
            return Err(Error::Configuration("max_attempts must be at least 1".into()));
        }
        if self.executor.initial_backoff_ms > self.executor.max_backoff_ms {
            return Err(Error::Configuration(
                "initial backoff must not exceed max backoff".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Capacity Parsing
// =============================================================================

/// Parse a capacity such as `"100"`, `"1.5G"` or `"64Mi"` into bytes
///
/// All units are binary: `K`, `KB`, `Ki` and `KiB` all mean 1024.
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_str, unit_str) = (&s[..num_end], s[num_end..].trim());

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1 << 10,
        "M" | "MB" | "MI" | "MIB" => 1 << 20,
        "G" | "GB" | "GI" | "GIB" => 1 << 30,
        "T" | "TB" | "TI" | "TIB" => 1 << 40,
        "P" | "PB" | "PI" | "PIB" => 1 << 50,
        _ => return Err(Error::CapacityParse(format!("unknown unit: {}", unit_str))),
    };

    let overflow = || Error::CapacityParse(format!("capacity too large: {}", s));

    // Whole numbers stay exact
    if let Ok(whole) = num_str.parse::<u64>() {
        return whole.checked_mul(multiplier).ok_or_else(overflow);
    }

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;
    let bytes = num * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(overflow());
    }
    Ok(bytes as u64)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CapacityValue {
    Bytes(u64),
    Text(String),
}

/// Serde helper accepting either a byte count or a capacity string
pub fn deserialize_capacity<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    match CapacityValue::deserialize(deserializer)? {
        CapacityValue::Bytes(bytes) => Ok(bytes),
        CapacityValue::Text(text) => parse_capacity(&text).map_err(serde::de::Error::custom),
    }
}

/// Like `deserialize_capacity`, for optional limits
pub fn deserialize_capacity_opt<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error> {
    match Option::<CapacityValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(CapacityValue::Bytes(bytes)) => Ok(Some(bytes)),
        Some(CapacityValue::Text(text)) => parse_capacity(&text).map(Some).map_err(serde::de::Error::custom),
    }
}
