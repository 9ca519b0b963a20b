//! In-Memory Block Device Backend
//!
//! Volume table kept in a DashMap. State does not survive a restart; used
//! by tests and single-process demos. Blockdevice ids are opaque and differ
//! from the dataset ids they store.

use crate::domain::model::DatasetId;
use crate::domain::ports::{BlockDeviceApi, BlockDeviceVolume};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Memory Backend Configuration
// =============================================================================

/// Configuration for the in-memory backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum bytes allocated across all volumes
    #[serde(deserialize_with = "crate::config::deserialize_capacity")]
    pub capacity_bytes: u64,
    /// Directory that reported device paths live under
    pub device_root: PathBuf,
    /// Listing lag reported to callers; listings themselves are always current
    #[serde(with = "duration_secs")]
    pub consistency_window: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 1024 * 1024 * 1024 * 1024, // 1 TiB
            device_root: PathBuf::from("/dev/memory"),
            consistency_window: Duration::ZERO,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Memory Backend
// =============================================================================

/// In-memory block device backend backed by DashMap
pub struct MemoryBlockDeviceApi {
    volumes: DashMap<String, BlockDeviceVolume>,
    /// Dataset id to blockdevice id; one volume per dataset
    datasets: DashMap<DatasetId, String>,
    allocated_bytes: AtomicU64,
    config: MemoryConfig,
}

impl MemoryBlockDeviceApi {
    /// Create a memory backend with default config
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Create a memory backend with a capacity limit
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self::with_config(MemoryConfig {
            capacity_bytes,
            ..Default::default()
        })
    }

    /// Create a memory backend with full config
    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            volumes: DashMap::new(),
            datasets: DashMap::new(),
            allocated_bytes: AtomicU64::new(0),
            config,
        }
    }

    /// Bytes currently allocated
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Reserve bytes against the capacity limit
    fn reserve(&self, bytes: u64) -> Result<()> {
        let capacity = self.config.capacity_bytes;
        self.allocated_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |allocated| {
                allocated.checked_add(bytes).filter(|total| *total <= capacity)
            })
            .map(|_| ())
            .map_err(|allocated| Error::InsufficientCapacity {
                requested: bytes,
                available: capacity.saturating_sub(allocated),
            })
    }

    fn release(&self, bytes: u64) {
        self.allocated_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }
}

impl Default for MemoryBlockDeviceApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockDeviceApi for MemoryBlockDeviceApi {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn create_volume(&self, dataset_id: &DatasetId, size: u64) -> Result<BlockDeviceVolume> {
        // The entry holds its shard lock until the volume is recorded
        let slot = match self.datasets.entry(dataset_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::BackendError {
                    backend: self.backend_name().to_string(),
                    operation: "create_volume".into(),
                    reason: format!("dataset {} already has a volume", dataset_id),
                });
            }
            Entry::Vacant(slot) => slot,
        };
        self.reserve(size)?;

        let volume = BlockDeviceVolume {
            blockdevice_id: format!("mem-{}", uuid::Uuid::new_v4().simple()),
            dataset_id: dataset_id.clone(),
            size,
            host: None,
        };
        self.volumes.insert(volume.blockdevice_id.clone(), volume.clone());
        slot.insert(volume.blockdevice_id.clone());

        debug!(blockdevice_id = %volume.blockdevice_id, dataset_id = %dataset_id, size, "Created memory volume");
        Ok(volume)
    }

    async fn destroy_volume(&self, blockdevice_id: &str) -> Result<()> {
        if let Some((_, volume)) = self.volumes.remove_if(blockdevice_id, |_, v| !v.is_attached()) {
            self.datasets.remove(&volume.dataset_id);
            self.release(volume.size);
            debug!(blockdevice_id, "Destroyed memory volume");
            return Ok(());
        }

        match self.volumes.get(blockdevice_id) {
            Some(volume) => Err(Error::VolumeAttached {
                blockdevice_id: blockdevice_id.to_string(),
                host: volume.host.clone().unwrap_or_default(),
            }),
            None => Err(Error::unknown_volume(blockdevice_id)),
        }
    }

    async fn attach_volume(&self, blockdevice_id: &str, host: &str) -> Result<BlockDeviceVolume> {
        // The shard write lock makes check-and-set atomic per volume
        let mut volume = self
            .volumes
            .get_mut(blockdevice_id)
            .ok_or_else(|| Error::unknown_volume(blockdevice_id))?;

        if let Some(current) = &volume.host {
            return Err(Error::AlreadyAttachedVolume {
                blockdevice_id: blockdevice_id.to_string(),
                host: current.clone(),
            });
        }
        volume.host = Some(host.to_string());

        debug!(blockdevice_id, host, "Attached memory volume");
        Ok(volume.clone())
    }

    async fn detach_volume(&self, blockdevice_id: &str) -> Result<()> {
        let mut volume = self
            .volumes
            .get_mut(blockdevice_id)
            .ok_or_else(|| Error::unknown_volume(blockdevice_id))?;
        if volume.host.take().is_some() {
            debug!(blockdevice_id, "Detached memory volume");
        }
        Ok(())
    }

    async fn resize_volume(&self, blockdevice_id: &str, size: u64) -> Result<BlockDeviceVolume> {
        let mut volume = self
            .volumes
            .get_mut(blockdevice_id)
            .ok_or_else(|| Error::unknown_volume(blockdevice_id))?;

        if size > volume.size {
            self.reserve(size - volume.size)?;
        } else {
            self.release(volume.size - size);
        }
        volume.size = size;

        Ok(volume.clone())
    }

    async fn list_volumes(&self) -> Result<Vec<BlockDeviceVolume>> {
        let mut volumes: Vec<_> = self.volumes.iter().map(|v| v.value().clone()).collect();
        volumes.sort();
        Ok(volumes)
    }

    async fn get_device_path(&self, blockdevice_id: &str) -> Result<PathBuf> {
        let volume = self
            .volumes
            .get(blockdevice_id)
            .ok_or_else(|| Error::unknown_volume(blockdevice_id))?;
        if !volume.is_attached() {
            return Err(Error::VolumeNotAttached {
                blockdevice_id: blockdevice_id.to_string(),
            });
        }
        Ok(self.config.device_root.join(blockdevice_id))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn consistency_window(&self) -> Duration {
        self.config.consistency_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_blockdevice_ids_are_opaque() {
        let api = MemoryBlockDeviceApi::new();
        let dataset_id = DatasetId::generate();
        let volume = api.create_volume(&dataset_id, 1234).await.unwrap();

        assert_ne!(volume.blockdevice_id, dataset_id.as_str());
        assert_eq!(
            api.find_dataset_volume(&dataset_id).await.unwrap(),
            Some(volume)
        );
    }

    #[tokio::test]
    async fn test_capacity_accounting() {
        let api = MemoryBlockDeviceApi::with_capacity(2000);
        let first = api.create_volume(&DatasetId::generate(), 1500).await.unwrap();
        assert_eq!(api.allocated_bytes(), 1500);

        assert_matches!(
            api.create_volume(&DatasetId::generate(), 1000).await,
            Err(Error::InsufficientCapacity { requested: 1000, available: 500 })
        );

        api.destroy_volume(&first.blockdevice_id).await.unwrap();
        assert_eq!(api.allocated_bytes(), 0);
        api.create_volume(&DatasetId::generate(), 1000).await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_tracks_capacity() {
        let api = MemoryBlockDeviceApi::with_capacity(4096);
        let volume = api.create_volume(&DatasetId::generate(), 1024).await.unwrap();

        api.resize_volume(&volume.blockdevice_id, 4096).await.unwrap();
        assert_eq!(api.allocated_bytes(), 4096);
        api.resize_volume(&volume.blockdevice_id, 2048).await.unwrap();
        assert_eq!(api.allocated_bytes(), 2048);

        assert_matches!(
            api.resize_volume(&volume.blockdevice_id, 8192).await,
            Err(Error::InsufficientCapacity { .. })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_same_dataset() {
        let api = std::sync::Arc::new(MemoryBlockDeviceApi::new());
        let dataset_id = DatasetId::generate();

        let creates: Vec<_> = (0..8)
            .map(|_| {
                let api = api.clone();
                let dataset_id = dataset_id.clone();
                tokio::spawn(async move { api.create_volume(&dataset_id, 1234).await })
            })
            .collect();

        let mut created = 0;
        for handle in creates {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert_matches!(e, Error::BackendError { .. }),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(api.list_volumes().await.unwrap().len(), 1);
        assert_eq!(api.allocated_bytes(), 1234);
    }

    #[tokio::test]
    async fn test_destroy_frees_dataset_slot() {
        let api = MemoryBlockDeviceApi::new();
        let dataset_id = DatasetId::generate();
        let first = api.create_volume(&dataset_id, 1234).await.unwrap();
        api.destroy_volume(&first.blockdevice_id).await.unwrap();

        let second = api.create_volume(&dataset_id, 1234).await.unwrap();
        assert_ne!(first.blockdevice_id, second.blockdevice_id);
    }

    #[tokio::test]
    async fn test_consistency_window_is_reported_only() {
        let api = MemoryBlockDeviceApi::with_config(MemoryConfig {
            consistency_window: Duration::from_secs(30),
            ..Default::default()
        });
        assert_eq!(api.consistency_window(), Duration::from_secs(30));

        let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
        assert_eq!(api.list_volumes().await.unwrap(), vec![volume]);
    }

    #[tokio::test]
    async fn test_device_path_under_root() {
        let api = MemoryBlockDeviceApi::new();
        let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
        api.attach_volume(&volume.blockdevice_id, "192.0.2.1").await.unwrap();

        let path = api.get_device_path(&volume.blockdevice_id).await.unwrap();
        assert_eq!(path, PathBuf::from("/dev/memory").join(&volume.blockdevice_id));
    }
}
