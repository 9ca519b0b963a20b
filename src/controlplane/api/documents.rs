//! Boundary Documents
//!
//! The JSON shapes exchanged with the configuration and state API:
//! `configuration_dataset`, `configuration_datasets_array`,
//! `state_datasets_array` and `versions`. Incoming documents are validated
//! as raw JSON before they are turned into a `Deployment`, so malformed
//! input never reaches the deployer.

use crate::domain::model::{
    ClusterState, Dataset, DatasetId, Deployment, Node, DATASET_ID_LENGTH, MINIMUM_DATASET_SIZE,
};
use crate::domain::ports::BlockDeviceApi;
use crate::error::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Limit on metadata entries and on the length of each key and value
pub const METADATA_LIMIT: usize = 256;

// =============================================================================
// Document Types
// =============================================================================

/// A dataset as placed by the configuration API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConfigurationDataset {
    /// IPv4 address of the node holding the primary manifestation
    pub primary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(length(equal = 36))]
    pub dataset_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 67108864))]
    pub maximum_size: Option<u64>,
    #[serde(default)]
    pub deleted: bool,
}

/// A dataset as observed on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StateDataset {
    pub primary: String,
    pub dataset_id: String,
    /// Local device path on the primary node
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_size: Option<u64>,
}

/// Software versions reported by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Versions {
    pub flocker: String,
}

impl Versions {
    pub fn current() -> Self {
        Self {
            flocker: crate::VERSION.to_string(),
        }
    }
}

/// JSON Schema of `configuration_dataset`
pub fn configuration_dataset_schema() -> Result<Value> {
    Ok(serde_json::to_value(schemars::schema_for!(ConfigurationDataset))?)
}

/// JSON Schema of one `state_datasets_array` entry
pub fn state_dataset_schema() -> Result<Value> {
    Ok(serde_json::to_value(schemars::schema_for!(StateDataset))?)
}

/// JSON Schema of `versions`
pub fn versions_schema() -> Result<Value> {
    Ok(serde_json::to_value(schemars::schema_for!(Versions))?)
}

// =============================================================================
// Validation
// =============================================================================

const CONFIGURATION_DATASET_FIELDS: &[&str] = &["primary", "dataset_id", "metadata", "maximum_size", "deleted"];
const STATE_DATASET_FIELDS: &[&str] = &["primary", "dataset_id", "path", "maximum_size"];

/// Validate one `configuration_dataset`
pub fn validate_configuration_dataset(value: &Value) -> Result<()> {
    validate_configuration_dataset_at(value, "configuration_dataset")
}

fn validate_configuration_dataset_at(value: &Value, at: &str) -> Result<()> {
    let object = expect_object(value, at)?;
    reject_unknown_fields(object, CONFIGURATION_DATASET_FIELDS, at)?;

    validate_ipv4(required(object, "primary", at)?, &field(at, "primary"))?;

    if let Some(dataset_id) = object.get("dataset_id") {
        let at = field(at, "dataset_id");
        let dataset_id = expect_str(dataset_id, &at)?;
        if dataset_id.chars().count() != DATASET_ID_LENGTH {
            return Err(invalid(&at, format!("must be exactly {} characters", DATASET_ID_LENGTH)));
        }
    }

    if let Some(metadata) = object.get("metadata") {
        validate_metadata(metadata, &field(at, "metadata"))?;
    }

    if let Some(maximum_size) = object.get("maximum_size") {
        let at = field(at, "maximum_size");
        let size = expect_u64(maximum_size, &at)?;
        if size < MINIMUM_DATASET_SIZE {
            return Err(invalid(&at, format!("must be at least {}", MINIMUM_DATASET_SIZE)));
        }
    }

    if let Some(deleted) = object.get("deleted") {
        if !deleted.is_boolean() {
            return Err(invalid(&field(at, "deleted"), "must be a boolean"));
        }
    }

    Ok(())
}

/// Validate a `configuration_datasets_array`
pub fn validate_configuration_datasets_array(value: &Value) -> Result<()> {
    let at = "configuration_datasets_array";
    expect_array(value, at)?
        .iter()
        .enumerate()
        .try_for_each(|(i, item)| validate_configuration_dataset_at(item, &format!("{}[{}]", at, i)))
}

/// Validate a `state_datasets_array`
pub fn validate_state_datasets_array(value: &Value) -> Result<()> {
    let at = "state_datasets_array";
    for (i, item) in expect_array(value, at)?.iter().enumerate() {
        let at = format!("{}[{}]", at, i);
        let object = expect_object(item, &at)?;
        reject_unknown_fields(object, STATE_DATASET_FIELDS, &at)?;

        validate_ipv4(required(object, "primary", &at)?, &field(&at, "primary"))?;
        expect_str(required(object, "dataset_id", &at)?, &field(&at, "dataset_id"))?;
        expect_str(required(object, "path", &at)?, &field(&at, "path"))?;
        if let Some(maximum_size) = object.get("maximum_size") {
            expect_u64(maximum_size, &field(&at, "maximum_size"))?;
        }
    }
    Ok(())
}

/// Validate a `versions` document
pub fn validate_versions(value: &Value) -> Result<()> {
    let at = "versions";
    let object = expect_object(value, at)?;
    reject_unknown_fields(object, &["flocker"], at)?;
    expect_str(required(object, "flocker", at)?, &field(at, "flocker"))?;
    Ok(())
}

fn validate_metadata(value: &Value, at: &str) -> Result<()> {
    let object = expect_object(value, at)?;
    if object.len() > METADATA_LIMIT {
        return Err(invalid(at, format!("must have at most {} entries", METADATA_LIMIT)));
    }
    for (key, value) in object {
        if key.chars().count() > METADATA_LIMIT {
            return Err(invalid(at, format!("key longer than {} characters", METADATA_LIMIT)));
        }
        let value = expect_str(value, &field(at, key))?;
        if value.chars().count() > METADATA_LIMIT {
            return Err(invalid(&field(at, key), format!("longer than {} characters", METADATA_LIMIT)));
        }
    }
    Ok(())
}

fn validate_ipv4(value: &Value, at: &str) -> Result<()> {
    let address = expect_str(value, at)?;
    address
        .parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| invalid(at, format!("{:?} is not an IPv4 address", address)))
}

fn expect_object<'a>(value: &'a Value, at: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| invalid(at, "must be an object"))
}

fn expect_array<'a>(value: &'a Value, at: &str) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| invalid(at, "must be an array"))
}

fn expect_str<'a>(value: &'a Value, at: &str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| invalid(at, "must be a string"))
}

fn expect_u64(value: &Value, at: &str) -> Result<u64> {
    value.as_u64().ok_or_else(|| invalid(at, "must be a non-negative integer"))
}

fn required<'a>(object: &'a Map<String, Value>, key: &str, at: &str) -> Result<&'a Value> {
    object.get(key).ok_or_else(|| invalid(at, format!("missing required field {:?}", key)))
}

fn reject_unknown_fields(object: &Map<String, Value>, allowed: &[&str], at: &str) -> Result<()> {
    match object.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(invalid(at, format!("unexpected field {:?}", key))),
        None => Ok(()),
    }
}

fn field(at: &str, name: &str) -> String {
    format!("{}.{}", at, name)
}

fn invalid(at: &str, message: impl std::fmt::Display) -> Error {
    Error::Validation(format!("{}: {}", at, message))
}

// =============================================================================
// Conversions
// =============================================================================

/// Validate and parse a `configuration_datasets_array`
pub fn parse_configuration_datasets(value: &Value) -> Result<Vec<ConfigurationDataset>> {
    validate_configuration_datasets_array(value)?;
    Ok(serde_json::from_value(value.clone())?)
}

/// Build the desired deployment from configuration documents
///
/// Datasets without an id get a fresh one. An id may appear only once.
pub fn deployment_from_configuration(datasets: Vec<ConfigurationDataset>) -> Result<Deployment> {
    let mut nodes: BTreeMap<String, Node> = BTreeMap::new();
    let mut seen = std::collections::BTreeSet::new();

    for document in datasets {
        let dataset_id = document
            .dataset_id
            .map(DatasetId::new)
            .unwrap_or_else(DatasetId::generate);
        if !seen.insert(dataset_id.clone()) {
            return Err(Error::Validation(format!("dataset {} configured more than once", dataset_id)));
        }

        let mut dataset = Dataset::new(dataset_id);
        dataset.maximum_size = document.maximum_size;
        dataset.metadata = document.metadata;
        dataset.deleted = document.deleted;

        let node = nodes
            .remove(&document.primary)
            .unwrap_or_else(|| Node::new(document.primary.clone()));
        nodes.insert(document.primary, node.with_primary(dataset));
    }

    Deployment::new(nodes.into_values())
}

/// Configuration documents for every primary in a deployment
pub fn configuration_from_deployment(deployment: &Deployment) -> Vec<ConfigurationDataset> {
    let mut documents: Vec<_> = deployment
        .nodes
        .iter()
        .flat_map(|node| {
            node.primaries().map(move |m| ConfigurationDataset {
                primary: node.hostname.clone(),
                dataset_id: Some(m.dataset.dataset_id.to_string()),
                metadata: m.dataset.metadata.clone(),
                maximum_size: m.dataset.maximum_size,
                deleted: m.dataset.deleted,
            })
        })
        .collect();
    documents.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));
    documents
}

/// State documents for every primary manifestation in the cluster
///
/// `path_for` supplies the device path of a dataset on a host; datasets
/// without a known path are left out.
pub fn state_datasets(
    state: &ClusterState,
    mut path_for: impl FnMut(&str, &DatasetId) -> Option<PathBuf>,
) -> Vec<StateDataset> {
    state
        .nodes
        .values()
        .flat_map(|node| {
            node.manifestations
                .iter()
                .filter(|m| m.primary)
                .map(move |m| (node.hostname.as_str(), m))
        })
        .filter_map(|(host, m)| {
            let path = path_for(host, m.dataset_id())?;
            Some(StateDataset {
                primary: host.to_string(),
                dataset_id: m.dataset_id().to_string(),
                path: path.to_string_lossy().into_owned(),
                maximum_size: m.dataset.maximum_size,
            })
        })
        .collect()
}

/// Device paths of the volumes attached to `hostname`
pub async fn device_paths(backend: &dyn BlockDeviceApi, hostname: &str) -> Result<BTreeMap<DatasetId, PathBuf>> {
    let mut paths = BTreeMap::new();
    for volume in backend.list_volumes().await? {
        if volume.is_attached_to(hostname) {
            let path = backend.get_device_path(&volume.blockdevice_id).await?;
            paths.insert(volume.dataset_id, path);
        }
    }
    Ok(paths)
}
