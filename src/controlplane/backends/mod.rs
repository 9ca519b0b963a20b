//! Block Device Backend Adapters
//!
//! Provides implementations of the block device contract:
//! - Loopback: flat files on a local filesystem (reference implementation)
//! - Memory: in-process volume table

pub mod loopback;
pub mod memory;

pub use loopback::*;
pub use memory::*;

use crate::domain::ports::BlockDeviceApiRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Factory for creating block device backends
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend by name
    ///
    /// The returned backend is not yet initialized.
    pub fn create(name: &str, config: BackendConfig) -> Result<BlockDeviceApiRef> {
        match name.to_lowercase().as_str() {
            "loopback" | "file" => Ok(Arc::new(LoopbackBlockDeviceApi::new(config.loopback))),
            "memory" | "mem" => Ok(Arc::new(MemoryBlockDeviceApi::with_config(config.memory))),
            _ => Err(Error::BackendUnavailable {
                backend: name.to_string(),
            }),
        }
    }

    /// Create the backend selected in the config
    pub fn from_config(config: BackendConfig) -> Result<BlockDeviceApiRef> {
        let name = config.name.clone();
        Self::create(&name, config)
    }
}

/// Combined backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Selected backend
    pub name: String,
    pub loopback: LoopbackConfig,
    pub memory: MemoryConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "loopback".to_string(),
            loopback: LoopbackConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

/// Contract tests every backend must pass
///
/// Instantiated once per backend with an async setup expression returning
/// `(BlockDeviceApiRef, guard)`; the guard is kept alive for the test.
#[cfg(test)]
macro_rules! block_device_api_conformance {
    ($name:ident, $setup:expr) => {
        mod $name {
            use super::*;
            use crate::domain::model::DatasetId;
            use crate::domain::ports::BlockDeviceApi;
            use crate::error::Error;
            use assert_matches::assert_matches;

            #[tokio::test]
            async fn test_initial_listing_empty() {
                let (api, _guard) = $setup.await;
                assert!(api.list_volumes().await.unwrap().is_empty());
            }

            #[tokio::test]
            async fn test_created_volume_listed() {
                let (api, _guard) = $setup.await;
                let dataset_id = DatasetId::generate();
                let volume = api.create_volume(&dataset_id, 1234).await.unwrap();

                assert_eq!(volume.size, 1234);
                assert_eq!(volume.host, None);
                assert_eq!(volume.dataset_id, dataset_id);
                assert_eq!(api.list_volumes().await.unwrap(), vec![volume]);
            }

            #[tokio::test]
            async fn test_attach_unknown_volume() {
                let (api, _guard) = $setup.await;
                let result = api.attach_volume(&DatasetId::generate().to_string(), "192.0.2.1").await;
                assert_matches!(result, Err(Error::UnknownVolume { .. }));
            }

            #[tokio::test]
            async fn test_attach_attached_volume_same_host() {
                let (api, _guard) = $setup.await;
                let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
                api.attach_volume(&volume.blockdevice_id, "192.0.2.1").await.unwrap();

                let result = api.attach_volume(&volume.blockdevice_id, "192.0.2.1").await;
                assert_matches!(result, Err(Error::AlreadyAttachedVolume { host, .. }) if host == "192.0.2.1");
            }

            #[tokio::test]
            async fn test_attach_attached_volume_other_host() {
                let (api, _guard) = $setup.await;
                let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
                api.attach_volume(&volume.blockdevice_id, "192.0.2.1").await.unwrap();

                let result = api.attach_volume(&volume.blockdevice_id, "192.0.2.2").await;
                assert_matches!(result, Err(Error::AlreadyAttachedVolume { host, .. }) if host == "192.0.2.1");
            }

            #[tokio::test]
            async fn test_attach_unattached_volume() {
                let (api, _guard) = $setup.await;
                let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();

                let attached = api.attach_volume(&volume.blockdevice_id, "192.0.2.1").await.unwrap();
                assert_eq!(attached, volume.with_host(Some("192.0.2.1")));
                assert_eq!(api.list_volumes().await.unwrap(), vec![attached]);
            }

            #[tokio::test]
            async fn test_attach_keeps_other_volumes() {
                let (api, _guard) = $setup.await;
                let first = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
                let second = api.create_volume(&DatasetId::generate(), 4321).await.unwrap();

                let attached = api.attach_volume(&first.blockdevice_id, "192.0.2.1").await.unwrap();

                let mut expected = vec![attached, second];
                expected.sort();
                assert_eq!(api.list_volumes().await.unwrap(), expected);
            }

            #[tokio::test]
            async fn test_detach_unknown_volume() {
                let (api, _guard) = $setup.await;
                let result = api.detach_volume("no-such-volume").await;
                assert_matches!(result, Err(Error::UnknownVolume { .. }));
            }

            #[tokio::test]
            async fn test_detach_is_idempotent() {
                let (api, _guard) = $setup.await;
                let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
                api.attach_volume(&volume.blockdevice_id, "192.0.2.1").await.unwrap();

                api.detach_volume(&volume.blockdevice_id).await.unwrap();
                api.detach_volume(&volume.blockdevice_id).await.unwrap();
                assert_eq!(api.list_volumes().await.unwrap(), vec![volume]);
            }

            #[tokio::test]
            async fn test_destroy_unknown_volume() {
                let (api, _guard) = $setup.await;
                let result = api.destroy_volume("no-such-volume").await;
                assert_matches!(result, Err(Error::UnknownVolume { .. }));
            }

            #[tokio::test]
            async fn test_destroy_removes_volume() {
                let (api, _guard) = $setup.await;
                let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();

                api.destroy_volume(&volume.blockdevice_id).await.unwrap();
                assert!(api.list_volumes().await.unwrap().is_empty());
                assert_matches!(
                    api.destroy_volume(&volume.blockdevice_id).await,
                    Err(Error::UnknownVolume { .. })
                );
            }

            #[tokio::test]
            async fn test_destroy_attached_volume_rejected() {
                let (api, _guard) = $setup.await;
                let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
                api.attach_volume(&volume.blockdevice_id, "192.0.2.1").await.unwrap();

                assert_matches!(
                    api.destroy_volume(&volume.blockdevice_id).await,
                    Err(Error::VolumeAttached { .. })
                );
                assert_eq!(api.list_volumes().await.unwrap().len(), 1);
            }

            #[tokio::test]
            async fn test_resize_volume() {
                let (api, _guard) = $setup.await;
                let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();

                let resized = api.resize_volume(&volume.blockdevice_id, 4096).await.unwrap();
                assert_eq!(resized.size, 4096);
                assert_eq!(api.list_volumes().await.unwrap()[0].size, 4096);

                assert_matches!(
                    api.resize_volume("no-such-volume", 4096).await,
                    Err(Error::UnknownVolume { .. })
                );
            }

            #[tokio::test]
            async fn test_device_path() {
                let (api, _guard) = $setup.await;
                let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();

                assert_matches!(
                    api.get_device_path(&volume.blockdevice_id).await,
                    Err(Error::VolumeNotAttached { .. })
                );
                assert_matches!(
                    api.get_device_path("no-such-volume").await,
                    Err(Error::UnknownVolume { .. })
                );

                api.attach_volume(&volume.blockdevice_id, "192.0.2.1").await.unwrap();
                let path = api.get_device_path(&volume.blockdevice_id).await.unwrap();
                assert!(path.is_absolute());
            }

            #[tokio::test]
            async fn test_attach_detach_reattach_scenario() {
                let (api, _guard) = $setup.await;
                let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
                let id = volume.blockdevice_id.clone();
                assert_eq!(api.list_volumes().await.unwrap(), vec![volume.clone()]);

                api.attach_volume(&id, "host-a").await.unwrap();
                assert_eq!(api.list_volumes().await.unwrap()[0].host.as_deref(), Some("host-a"));

                assert_matches!(api.attach_volume(&id, "host-a").await, Err(Error::AlreadyAttachedVolume { .. }));
                assert_matches!(api.attach_volume(&id, "host-b").await, Err(Error::AlreadyAttachedVolume { .. }));

                api.detach_volume(&id).await.unwrap();
                assert_eq!(api.list_volumes().await.unwrap()[0].host, None);

                let reattached = api.attach_volume(&id, "host-b").await.unwrap();
                assert!(reattached.is_attached_to("host-b"));
            }

            #[tokio::test]
            async fn test_concurrent_attach_mutual_exclusion() {
                let (api, _guard) = $setup.await;
                let volume = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();

                let attempts = (0..8).map(|i| {
                    let api = api.clone();
                    let id = volume.blockdevice_id.clone();
                    tokio::spawn(async move { api.attach_volume(&id, &format!("host-{}", i)).await })
                });
                let results = futures::future::join_all(attempts).await;

                let succeeded = results
                    .into_iter()
                    .map(|joined| joined.unwrap())
                    .filter(|result| result.is_ok())
                    .count();
                assert_eq!(succeeded, 1);
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn test_listing_during_attach_detach() {
                let (api, _guard) = $setup.await;
                let moving = api.create_volume(&DatasetId::generate(), 1234).await.unwrap();
                let resting = api.create_volume(&DatasetId::generate(), 4321).await.unwrap();

                let churn = {
                    let api = api.clone();
                    let id = moving.blockdevice_id.clone();
                    tokio::spawn(async move {
                        for _ in 0..50 {
                            api.attach_volume(&id, "host-a").await.unwrap();
                            api.detach_volume(&id).await.unwrap();
                        }
                    })
                };

                while !churn.is_finished() {
                    let volumes = api.list_volumes().await.unwrap();
                    assert_eq!(volumes.len(), 2);
                    assert_eq!(
                        volumes.iter().filter(|v| v.blockdevice_id == moving.blockdevice_id).count(),
                        1
                    );
                    assert!(volumes.contains(&resting));
                    tokio::task::yield_now().await;
                }
                churn.await.unwrap();
            }

            #[tokio::test]
            async fn test_find_dataset_volume() {
                let (api, _guard) = $setup.await;
                let dataset_id = DatasetId::generate();
                assert_eq!(api.find_dataset_volume(&dataset_id).await.unwrap(), None);

                let volume = api.create_volume(&dataset_id, 1234).await.unwrap();
                assert_eq!(api.find_dataset_volume(&dataset_id).await.unwrap(), Some(volume));
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::BlockDeviceApi;
    use tempfile::TempDir;

    async fn loopback_setup() -> (BlockDeviceApiRef, TempDir) {
        let tmp = TempDir::new().unwrap();
        let api = LoopbackBlockDeviceApi::from_path(tmp.path()).await.unwrap();
        (Arc::new(api), tmp)
    }

    async fn memory_setup() -> (BlockDeviceApiRef, ()) {
        (Arc::new(MemoryBlockDeviceApi::new()), ())
    }

    block_device_api_conformance!(loopback_conformance, loopback_setup());
    block_device_api_conformance!(memory_conformance, memory_setup());

    #[tokio::test]
    async fn test_factory_creates_named_backends() {
        let tmp = TempDir::new().unwrap();
        let mut config = BackendConfig::default();
        config.loopback.root_path = tmp.path().to_path_buf();

        let loopback = BackendFactory::create("loopback", config.clone()).unwrap();
        loopback.initialize().await.unwrap();
        assert_eq!(loopback.backend_name(), "loopback");
        assert!(tmp.path().join("unattached").is_dir());

        let memory = BackendFactory::create("MEMORY", config).unwrap();
        assert_eq!(memory.backend_name(), "memory");
    }

    #[test]
    fn test_factory_rejects_unknown_backend() {
        let result = BackendFactory::create("zfs", BackendConfig::default());
        assert!(matches!(result, Err(Error::BackendUnavailable { backend }) if backend == "zfs"));
    }

    #[test]
    fn test_backend_config_from_yaml() {
        let yaml = "name: memory\nmemory:\n  capacity_bytes: 4096\n";
        let config: BackendConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name, "memory");
        assert_eq!(config.memory.capacity_bytes, 4096);
        assert_eq!(config.loopback.root_path, LoopbackConfig::default().root_path);
    }
}
