//! Loopback Block Device Backend
//!
//! Stores each volume as a flat file of `size` bytes on the local
//! filesystem:
//!
//! ```text
//! <root>/unattached/<blockdevice_id>
//! <root>/attached/<host>/<blockdevice_id>
//! ```
//!
//! Attach and detach are renames between the two trees, which are atomic
//! within one filesystem. The blockdevice id of a loopback volume is the id
//! of the dataset it stores. Destroying an attached volume is rejected; the
//! caller must detach first.
//!
//! Within one process, listings hold the tree lock shared and every
//! mutation holds it exclusively, so a listing never observes a volume
//! mid-rename and capacity checks cannot interleave.

use crate::domain::model::DatasetId;
use crate::domain::ports::{BlockDeviceApi, BlockDeviceVolume};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const UNATTACHED_DIR: &str = "unattached";
const ATTACHED_DIR: &str = "attached";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the loopback backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Root directory holding the volume files
    pub root_path: PathBuf,
    /// Total bytes that may be allocated across all volumes
    #[serde(deserialize_with = "crate::config::deserialize_capacity_opt")]
    pub capacity_bytes: Option<u64>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/var/lib/dataset-agent/loopback"),
            capacity_bytes: None,
        }
    }
}

// =============================================================================
// Volume Location
// =============================================================================

/// Where a volume file currently lives
#[derive(Debug, Clone)]
struct Located {
    path: PathBuf,
    host: Option<String>,
    size: u64,
}

// =============================================================================
// Loopback Backend
// =============================================================================

/// File-backed block device backend, the reference implementation of the contract
pub struct LoopbackBlockDeviceApi {
    root_path: PathBuf,
    capacity_bytes: Option<u64>,
    tree_lock: RwLock<()>,
}

impl LoopbackBlockDeviceApi {
    /// Create a loopback backend rooted at the given directory
    pub async fn from_path(root_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(LoopbackConfig {
            root_path: root_path.into(),
            ..Default::default()
        })
        .await
    }

    /// Create a loopback backend with full config
    pub async fn with_config(config: LoopbackConfig) -> Result<Self> {
        let api = Self::new(config);
        api.initialize().await?;
        Ok(api)
    }

    /// Create without touching the filesystem; call `initialize` before use
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            root_path: config.root_path,
            capacity_bytes: config.capacity_bytes,
            tree_lock: RwLock::new(()),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn unattached_dir(&self) -> PathBuf {
        self.root_path.join(UNATTACHED_DIR)
    }

    fn attached_dir(&self) -> PathBuf {
        self.root_path.join(ATTACHED_DIR)
    }

    fn host_dir(&self, host: &str) -> PathBuf {
        self.attached_dir().join(host)
    }

    /// Find the file for a volume, if it exists
    async fn locate(&self, blockdevice_id: &str) -> Result<Option<Located>> {
        if !is_safe_component(blockdevice_id) {
            return Ok(None);
        }

        let unattached = self.unattached_dir().join(blockdevice_id);
        if let Some(size) = file_size(&unattached).await? {
            return Ok(Some(Located {
                path: unattached,
                host: None,
                size,
            }));
        }

        let mut hosts = match fs::read_dir(self.attached_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(host_entry) = hosts.next_entry().await? {
            if !is_dir_entry(&host_entry).await? {
                continue;
            }
            let path = host_entry.path().join(blockdevice_id);
            if let Some(size) = file_size(&path).await? {
                return Ok(Some(Located {
                    path,
                    host: Some(host_entry.file_name().to_string_lossy().into_owned()),
                    size,
                }));
            }
        }

        Ok(None)
    }

    async fn locate_required(&self, blockdevice_id: &str) -> Result<Located> {
        self.locate(blockdevice_id)
            .await?
            .ok_or_else(|| Error::unknown_volume(blockdevice_id))
    }

    /// Read every volume file in one directory
    async fn volumes_in(&self, dir: &Path, host: Option<&str>) -> Result<Vec<BlockDeviceVolume>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut volumes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            // Renamed or removed outside this process since the directory was read
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            let blockdevice_id = entry.file_name().to_string_lossy().into_owned();
            if !is_safe_component(&blockdevice_id) {
                continue;
            }
            volumes.push(BlockDeviceVolume {
                dataset_id: DatasetId::new(blockdevice_id.clone()),
                blockdevice_id,
                size: metadata.len(),
                host: host.map(str::to_string),
            });
        }
        Ok(volumes)
    }

    /// Every volume in both trees; the caller holds `tree_lock`
    async fn scan_volumes(&self) -> Result<Vec<BlockDeviceVolume>> {
        let mut volumes = self.volumes_in(&self.unattached_dir(), None).await?;

        let mut hosts = match fs::read_dir(self.attached_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(volumes),
            Err(e) => return Err(e.into()),
        };
        while let Some(host_entry) = hosts.next_entry().await? {
            if !is_dir_entry(&host_entry).await? {
                continue;
            }
            let host = host_entry.file_name().to_string_lossy().into_owned();
            volumes.extend(self.volumes_in(&host_entry.path(), Some(&host)).await?);
        }

        volumes.sort();
        Ok(volumes)
    }

    /// Total bytes allocated across all volumes; the caller holds `tree_lock`
    async fn allocated_bytes(&self) -> Result<u64> {
        Ok(self.scan_volumes().await?.iter().map(|v| v.size).sum())
    }

    async fn ensure_capacity(&self, additional: u64) -> Result<()> {
        let Some(capacity) = self.capacity_bytes else {
            return Ok(());
        };
        let allocated = self.allocated_bytes().await?;
        let available = capacity.saturating_sub(allocated);
        if additional > available {
            return Err(Error::InsufficientCapacity {
                requested: additional,
                available,
            });
        }
        Ok(())
    }

    fn backend_error(&self, operation: &str, reason: impl Into<String>) -> Error {
        Error::BackendError {
            backend: self.backend_name().to_string(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl BlockDeviceApi for LoopbackBlockDeviceApi {
    fn backend_name(&self) -> &str {
        "loopback"
    }

    async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(self.unattached_dir()).await?;
        fs::create_dir_all(self.attached_dir()).await?;
        info!(root = %self.root_path.display(), "Loopback backend initialized");
        Ok(())
    }

    async fn create_volume(&self, dataset_id: &DatasetId, size: u64) -> Result<BlockDeviceVolume> {
        let blockdevice_id = dataset_id.as_str();
        if !is_safe_component(blockdevice_id) {
            return Err(self.backend_error("create_volume", format!("invalid dataset id {:?}", blockdevice_id)));
        }
        let _tree = self.tree_lock.write().await;
        if self.locate(blockdevice_id).await?.is_some() {
            return Err(self.backend_error("create_volume", format!("volume {} already exists", blockdevice_id)));
        }
        self.ensure_capacity(size).await?;

        let path = self.unattached_dir().join(blockdevice_id);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => {
                    self.backend_error("create_volume", format!("volume {} already exists", blockdevice_id))
                }
                _ => e.into(),
            })?;
        // Sparse allocation; only metadata is written
        file.set_len(size).await?;
        file.sync_all().await?;

        debug!(blockdevice_id, size, "Created loopback volume");

        Ok(BlockDeviceVolume {
            blockdevice_id: blockdevice_id.to_string(),
            dataset_id: dataset_id.clone(),
            size,
            host: None,
        })
    }

    async fn destroy_volume(&self, blockdevice_id: &str) -> Result<()> {
        let _tree = self.tree_lock.write().await;
        let located = self.locate_required(blockdevice_id).await?;
        if let Some(host) = located.host {
            return Err(Error::VolumeAttached {
                blockdevice_id: blockdevice_id.to_string(),
                host,
            });
        }

        match fs::remove_file(&located.path).await {
            Ok(()) => {
                debug!(blockdevice_id, "Destroyed loopback volume");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::unknown_volume(blockdevice_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn attach_volume(&self, blockdevice_id: &str, host: &str) -> Result<BlockDeviceVolume> {
        if !is_safe_component(host) {
            return Err(self.backend_error("attach_volume", format!("invalid host name {:?}", host)));
        }

        let _tree = self.tree_lock.write().await;
        let located = self.locate_required(blockdevice_id).await?;
        if let Some(current) = located.host {
            return Err(Error::AlreadyAttachedVolume {
                blockdevice_id: blockdevice_id.to_string(),
                host: current,
            });
        }

        let host_dir = self.host_dir(host);
        fs::create_dir_all(&host_dir).await?;
        let target = host_dir.join(blockdevice_id);

        if let Err(e) = fs::rename(&located.path, &target).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
            // Lost a race with another attach or a destroy
            return match self.locate(blockdevice_id).await? {
                Some(Located { host: Some(current), .. }) => Err(Error::AlreadyAttachedVolume {
                    blockdevice_id: blockdevice_id.to_string(),
                    host: current,
                }),
                _ => Err(Error::unknown_volume(blockdevice_id)),
            };
        }

        let size = file_size(&target).await?.unwrap_or(0);
        if size != located.size {
            warn!(blockdevice_id, expected = located.size, actual = size, "Volume size changed during attach");
            return Err(self.backend_error(
                "attach_volume",
                format!("size mismatch after attach: expected {}, found {}", located.size, size),
            ));
        }

        debug!(blockdevice_id, host, "Attached loopback volume");

        Ok(BlockDeviceVolume {
            blockdevice_id: blockdevice_id.to_string(),
            dataset_id: DatasetId::new(blockdevice_id),
            size,
            host: Some(host.to_string()),
        })
    }

    async fn detach_volume(&self, blockdevice_id: &str) -> Result<()> {
        let _tree = self.tree_lock.write().await;
        let located = self.locate_required(blockdevice_id).await?;
        if located.host.is_none() {
            return Ok(());
        }

        let target = self.unattached_dir().join(blockdevice_id);
        match fs::rename(&located.path, &target).await {
            Ok(()) => {
                debug!(blockdevice_id, "Detached loopback volume");
                Ok(())
            }
            // A concurrent detach already moved it
            Err(e) if e.kind() == ErrorKind::NotFound => match file_size(&target).await? {
                Some(_) => Ok(()),
                None => Err(Error::unknown_volume(blockdevice_id)),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn resize_volume(&self, blockdevice_id: &str, size: u64) -> Result<BlockDeviceVolume> {
        let _tree = self.tree_lock.write().await;
        let located = self.locate_required(blockdevice_id).await?;
        if size > located.size {
            self.ensure_capacity(size - located.size).await?;
        }

        let file = fs::OpenOptions::new().write(true).open(&located.path).await?;
        file.set_len(size).await?;
        file.sync_all().await?;

        debug!(blockdevice_id, from = located.size, to = size, "Resized loopback volume");

        Ok(BlockDeviceVolume {
            blockdevice_id: blockdevice_id.to_string(),
            dataset_id: DatasetId::new(blockdevice_id),
            size,
            host: located.host,
        })
    }

    async fn list_volumes(&self) -> Result<Vec<BlockDeviceVolume>> {
        let _tree = self.tree_lock.read().await;
        self.scan_volumes().await
    }

    async fn get_device_path(&self, blockdevice_id: &str) -> Result<PathBuf> {
        let _tree = self.tree_lock.read().await;
        let located = self.locate_required(blockdevice_id).await?;
        match located.host {
            Some(_) => Ok(located.path),
            None => Err(Error::VolumeNotAttached {
                blockdevice_id: blockdevice_id.to_string(),
            }),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        // Check that root directory exists and is writable
        let test_path = self.root_path.join(".health_check");
        match fs::write(&test_path, b"ok").await {
            Ok(_) => {
                let _ = fs::remove_file(&test_path).await;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

/// Size of a regular file, or `None` if it does not exist
async fn file_size(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path).await {
        Ok(m) if m.is_file() => Ok(Some(m.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Whether a directory entry is a directory, treating a vanished entry as not
async fn is_dir_entry(entry: &fs::DirEntry) -> Result<bool> {
    match entry.file_type().await {
        Ok(file_type) => Ok(file_type.is_dir()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Whether a name can be used as a single path component
fn is_safe_component(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    async fn test_api() -> (LoopbackBlockDeviceApi, TempDir) {
        let tmp = TempDir::new().unwrap();
        let api = LoopbackBlockDeviceApi::from_path(tmp.path()).await.unwrap();
        (api, tmp)
    }

    #[tokio::test]
    async fn test_list_unattached_volumes() {
        let (api, _tmp) = test_api().await;
        let dataset_id = DatasetId::generate();

        std::fs::write(
            api.root_path().join(UNATTACHED_DIR).join(dataset_id.as_str()),
            vec![b'x'; 1234],
        )
        .unwrap();

        let expected = BlockDeviceVolume {
            blockdevice_id: dataset_id.to_string(),
            dataset_id,
            size: 1234,
            host: None,
        };
        assert_eq!(api.list_volumes().await.unwrap(), vec![expected]);
    }

    #[tokio::test]
    async fn test_list_attached_volumes() {
        let (api, _tmp) = test_api().await;
        let dataset_id = DatasetId::generate();

        let host_dir = api.root_path().join(ATTACHED_DIR).join("192.0.2.123");
        std::fs::create_dir_all(&host_dir).unwrap();
        std::fs::write(host_dir.join(dataset_id.as_str()), vec![b'x'; 1234]).unwrap();

        let expected = BlockDeviceVolume {
            blockdevice_id: dataset_id.to_string(),
            dataset_id,
            size: 1234,
            host: Some("192.0.2.123".into()),
        };
        assert_eq!(api.list_volumes().await.unwrap(), vec![expected]);
    }

    #[tokio::test]
    async fn test_attach_moves_file() {
        let (api, _tmp) = test_api().await;
        let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();

        api.attach_volume(&volume.blockdevice_id, "192.0.2.1").await.unwrap();

        let attached_path = api
            .root_path()
            .join(ATTACHED_DIR)
            .join("192.0.2.1")
            .join(&volume.blockdevice_id);
        assert!(attached_path.exists());
        assert!(!api.root_path().join(UNATTACHED_DIR).join(&volume.blockdevice_id).exists());
        assert_eq!(api.get_device_path(&volume.blockdevice_id).await.unwrap(), attached_path);
    }

    #[tokio::test]
    async fn test_destroy_attached_volume_rejected() {
        let (api, _tmp) = test_api().await;
        let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
        api.attach_volume(&volume.blockdevice_id, "192.0.2.1").await.unwrap();

        let result = api.destroy_volume(&volume.blockdevice_id).await;
        assert_matches!(result, Err(Error::VolumeAttached { host, .. }) if host == "192.0.2.1");
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let tmp = TempDir::new().unwrap();
        let api = LoopbackBlockDeviceApi::with_config(LoopbackConfig {
            root_path: tmp.path().to_path_buf(),
            capacity_bytes: Some(2000),
        })
        .await
        .unwrap();

        api.create_volume(&DatasetId::generate(), 1500).await.unwrap();
        let result = api.create_volume(&DatasetId::generate(), 1000).await;
        assert_matches!(result, Err(Error::InsufficientCapacity { available: 500, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_respect_capacity() {
        let tmp = TempDir::new().unwrap();
        let api = std::sync::Arc::new(
            LoopbackBlockDeviceApi::with_config(LoopbackConfig {
                root_path: tmp.path().to_path_buf(),
                capacity_bytes: Some(4000),
            })
            .await
            .unwrap(),
        );

        let creates: Vec<_> = (0..8)
            .map(|_| {
                let api = api.clone();
                tokio::spawn(async move { api.create_volume(&DatasetId::generate(), 1000).await })
            })
            .collect();

        let mut created = 0;
        for handle in creates {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert_matches!(e, Error::InsufficientCapacity { .. }),
            }
        }
        assert_eq!(created, 4);
        let total: u64 = api.list_volumes().await.unwrap().iter().map(|v| v.size).sum();
        assert_eq!(total, 4000);
    }

    #[tokio::test]
    async fn test_unsafe_ids_are_unknown() {
        let (api, _tmp) = test_api().await;
        assert_matches!(
            api.attach_volume("../escape", "192.0.2.1").await,
            Err(Error::UnknownVolume { .. })
        );
        assert_matches!(
            api.create_volume(&DatasetId::new("a/b"), 10).await,
            Err(Error::BackendError { .. })
        );
    }

    #[tokio::test]
    async fn test_volumes_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let dataset_id = DatasetId::generate();
        {
            let api = LoopbackBlockDeviceApi::from_path(tmp.path()).await.unwrap();
            let volume = api.create_volume(&dataset_id, 4096).await.unwrap();
            api.attach_volume(&volume.blockdevice_id, "192.0.2.9").await.unwrap();
        }

        let api = LoopbackBlockDeviceApi::from_path(tmp.path()).await.unwrap();
        let volumes = api.list_volumes().await.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].dataset_id, dataset_id);
        assert!(volumes[0].is_attached_to("192.0.2.9"));
    }
}
