//! Domain Ports - Core trait definitions for the convergence agent
//!
//! These traits define the boundaries between the convergence logic and
//! external systems. Adapters implement these traits to provide concrete
//! functionality.

use crate::domain::model::{DatasetId, Deployment};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// =============================================================================
// Block Device Volume
// =============================================================================

/// A block-storage volume as reported by a backend
///
/// `host == None` means the volume is not attached anywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockDeviceVolume {
    /// Opaque backend-assigned identifier
    pub blockdevice_id: String,
    /// Dataset this volume stores
    pub dataset_id: DatasetId,
    /// Size in bytes
    pub size: u64,
    /// Host the volume is attached to
    pub host: Option<String>,
}

impl BlockDeviceVolume {
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.host.is_some()
    }

    #[inline]
    pub fn is_attached_to(&self, host: &str) -> bool {
        self.host.as_deref() == Some(host)
    }

    /// The same volume with its attachment changed
    pub fn with_host(&self, host: Option<&str>) -> Self {
        Self {
            host: host.map(str::to_string),
            ..self.clone()
        }
    }
}

// =============================================================================
// Block Device Backend Port
// =============================================================================

/// Port for block-device volume lifecycle operations
///
/// Every operation must be safe to retry after a crash part-way through.
/// `list_volumes` is the single source of truth for observed volume state.
#[async_trait]
pub trait BlockDeviceApi: Send + Sync {
    /// Get backend name
    fn backend_name(&self) -> &str;

    /// One-time setup before the convergence loop starts
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Allocate a new unattached volume of at least `size` bytes for a dataset
    async fn create_volume(&self, dataset_id: &DatasetId, size: u64) -> Result<BlockDeviceVolume>;

    /// Remove a volume; it must not be attached
    async fn destroy_volume(&self, blockdevice_id: &str) -> Result<()>;

    /// Attach an unattached volume to `host`
    ///
    /// Fails with `AlreadyAttachedVolume` if the volume is attached anywhere,
    /// including to `host` itself.
    async fn attach_volume(&self, blockdevice_id: &str, host: &str) -> Result<BlockDeviceVolume>;

    /// Detach a volume; a no-op if it is already unattached
    async fn detach_volume(&self, blockdevice_id: &str) -> Result<()>;

    /// Change the size of a volume
    async fn resize_volume(&self, blockdevice_id: &str, size: u64) -> Result<BlockDeviceVolume>;

    /// Enumerate every volume known to the backend
    async fn list_volumes(&self) -> Result<Vec<BlockDeviceVolume>>;

    /// Host-local path of an attached volume
    async fn get_device_path(&self, blockdevice_id: &str) -> Result<PathBuf>;

    /// Check if backend is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Upper bound on how long a listing may lag behind a completed call
    fn consistency_window(&self) -> Duration {
        Duration::ZERO
    }

    /// Find the volume holding a dataset, if one exists
    async fn find_dataset_volume(&self, dataset_id: &DatasetId) -> Result<Option<BlockDeviceVolume>> {
        Ok(self
            .list_volumes()
            .await?
            .into_iter()
            .find(|v| &v.dataset_id == dataset_id))
    }
}

// =============================================================================
// Configuration Store Port
// =============================================================================

/// Port for reading and writing the desired configuration
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// Load the current desired configuration
    async fn load(&self) -> Result<Deployment>;

    /// Replace the desired configuration
    async fn save(&self, deployment: &Deployment) -> Result<()>;

    /// Change notifications; the value is a generation counter bumped on every save
    fn subscribe(&self) -> watch::Receiver<u64>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type BlockDeviceApiRef = Arc<dyn BlockDeviceApi>;
pub type ConfigurationStoreRef = Arc<dyn ConfigurationStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_attachment_helpers() {
        let volume = BlockDeviceVolume {
            blockdevice_id: "vol-1".into(),
            dataset_id: DatasetId::new("d".repeat(36)),
            size: 1234,
            host: None,
        };
        assert!(!volume.is_attached());

        let attached = volume.with_host(Some("192.0.2.1"));
        assert!(attached.is_attached_to("192.0.2.1"));
        assert!(!attached.is_attached_to("192.0.2.2"));
        assert_eq!(attached.with_host(None), volume);
    }
}
