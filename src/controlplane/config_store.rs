//! Configuration Stores
//!
//! Holders of the desired `Deployment`. Every save bumps a generation
//! counter on a watch channel so the convergence loop can start a pass
//! without waiting for its next tick.

use crate::domain::model::Deployment;
use crate::domain::ports::ConfigurationStore;
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

// =============================================================================
// In-Memory Store
// =============================================================================

/// Configuration store kept in process memory
pub struct InMemoryConfigurationStore {
    deployment: RwLock<Deployment>,
    generation: watch::Sender<u64>,
}

impl InMemoryConfigurationStore {
    pub fn new(initial: Deployment) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            deployment: RwLock::new(initial),
            generation,
        }
    }
}

impl Default for InMemoryConfigurationStore {
    fn default() -> Self {
        Self::new(Deployment::default())
    }
}

#[async_trait]
impl ConfigurationStore for InMemoryConfigurationStore {
    async fn load(&self) -> Result<Deployment> {
        Ok(self.deployment.read().await.clone())
    }

    async fn save(&self, deployment: &Deployment) -> Result<()> {
        deployment.check_single_primary()?;
        *self.deployment.write().await = deployment.clone();
        self.generation.send_modify(|g| *g += 1);
        debug!(nodes = deployment.nodes.len(), "Configuration saved");
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

// =============================================================================
// YAML File Store
// =============================================================================

/// Configuration store persisted as a YAML document
///
/// A missing file reads as an empty deployment. Writes go to a temporary
/// file that is renamed over the old one.
pub struct FileConfigurationStore {
    path: PathBuf,
    /// Serializes writers
    write_lock: tokio::sync::Mutex<()>,
    generation: watch::Sender<u64>,
}

impl FileConfigurationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
            generation,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ConfigurationStore for FileConfigurationStore {
    async fn load(&self) -> Result<Deployment> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Deployment::default()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Deployment::default());
        }

        let deployment: Deployment = serde_yaml::from_str(&content)?;
        deployment.check_single_primary()?;
        Ok(deployment)
    }

    async fn save(&self, deployment: &Deployment) -> Result<()> {
        deployment.check_single_primary()?;
        let content = serde_yaml::to_string(deployment)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let temp = self.temp_path();
        fs::write(&temp, content).await?;
        fs::rename(&temp, &self.path).await?;

        self.generation.send_modify(|g| *g += 1);
        info!(path = %self.path.display(), nodes = deployment.nodes.len(), "Configuration saved");
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Dataset, DatasetId, Node, MINIMUM_DATASET_SIZE};
    use crate::error::Error;
    use assert_matches::assert_matches;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn sample_deployment() -> Deployment {
        let dataset = Dataset::new(DatasetId::generate())
            .with_maximum_size(MINIMUM_DATASET_SIZE)
            .with_metadata("name", "db");
        Deployment::new([Node::new("192.0.2.1").with_primary(dataset), Node::new("192.0.2.2")]).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_notifies_on_save() {
        let store = InMemoryConfigurationStore::default();
        let mut changes = store.subscribe();
        assert_eq!(store.load().await.unwrap(), Deployment::default());

        let deployment = sample_deployment();
        assert_ok!(store.save(&deployment).await);

        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow(), 1);
        assert_eq!(store.load().await.unwrap(), deployment);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_duplicate_primary() {
        let store = InMemoryConfigurationStore::default();
        let dataset = Dataset::new(DatasetId::generate());
        let invalid = Deployment {
            nodes: [
                Node::new("192.0.2.1").with_primary(dataset.clone()),
                Node::new("192.0.2.2").with_primary(dataset),
            ]
            .into_iter()
            .collect(),
        };

        assert_matches!(store.save(&invalid).await, Err(Error::DuplicatePrimary { .. }));
        assert_eq!(*store.subscribe().borrow(), 0);
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = FileConfigurationStore::new(tmp.path().join("deployment.yaml"));
        assert_eq!(store.load().await.unwrap(), Deployment::default());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config").join("deployment.yaml");
        let deployment = sample_deployment();

        assert_ok!(FileConfigurationStore::new(&path).save(&deployment).await);
        assert!(!tmp.path().join("config").join("deployment.yaml.tmp").exists());

        let reopened = FileConfigurationStore::new(&path);
        assert_eq!(reopened.load().await.unwrap(), deployment);
    }

    #[tokio::test]
    async fn test_file_store_rejects_malformed_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deployment.yaml");
        std::fs::write(&path, "nodes: [unterminated").unwrap();

        let store = FileConfigurationStore::new(&path);
        assert_matches!(store.load().await, Err(Error::YamlParse(_)));
    }
}
