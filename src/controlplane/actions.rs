//! Convergence Actions
//!
//! Each action targets exactly one dataset and is idempotent: `run` always
//! re-reads the backend listing before mutating anything, so it can be
//! invoked again after a previous attempt failed part-way through.

use crate::domain::model::{Dataset, DatasetId};
use crate::domain::ports::{BlockDeviceApi, BlockDeviceVolume};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A single step towards the desired configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Allocate a volume for the dataset and attach it to this node
    CreateDataset { dataset: Dataset, size: u64 },
    /// Attach an existing unattached volume to this node
    AttachVolume { dataset_id: DatasetId },
    /// Release the dataset's volume from this node
    DetachVolume { dataset_id: DatasetId },
    /// Detach if needed, then remove the volume
    DestroyDataset { dataset_id: DatasetId },
    /// Change the size of the dataset's volume
    ResizeVolume { dataset_id: DatasetId, size: u64 },
    /// Take over a dataset once `from` has released it
    HandoffDataset { dataset_id: DatasetId, from: String },
}

impl Action {
    /// Dataset this action touches; the executor serializes on it
    pub fn dataset_id(&self) -> &DatasetId {
        match self {
            Action::CreateDataset { dataset, .. } => &dataset.dataset_id,
            Action::AttachVolume { dataset_id }
            | Action::DetachVolume { dataset_id }
            | Action::DestroyDataset { dataset_id }
            | Action::ResizeVolume { dataset_id, .. }
            | Action::HandoffDataset { dataset_id, .. } => dataset_id,
        }
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Action::CreateDataset { .. } => "create_dataset",
            Action::AttachVolume { .. } => "attach_volume",
            Action::DetachVolume { .. } => "detach_volume",
            Action::DestroyDataset { .. } => "destroy_dataset",
            Action::ResizeVolume { .. } => "resize_volume",
            Action::HandoffDataset { .. } => "handoff_dataset",
        }
    }

    /// Apply the action on behalf of `hostname`
    pub async fn run(&self, backend: &dyn BlockDeviceApi, hostname: &str) -> Result<()> {
        let existing = backend.find_dataset_volume(self.dataset_id()).await?;

        match self {
            Action::CreateDataset { dataset, size } => {
                let volume = match existing {
                    Some(volume) => {
                        debug!(dataset_id = %dataset.dataset_id, "Volume exists from an earlier attempt");
                        volume
                    }
                    None => backend.create_volume(&dataset.dataset_id, *size).await?,
                };
                attach_here(backend, &volume, hostname).await
            }

            Action::AttachVolume { dataset_id } => {
                let volume = existing.ok_or_else(|| Error::unknown_volume(dataset_id.as_str()))?;
                attach_here(backend, &volume, hostname).await
            }

            Action::DetachVolume { dataset_id } => match existing {
                Some(volume) if volume.is_attached_to(hostname) => {
                    backend.detach_volume(&volume.blockdevice_id).await.or_else(ignore_unknown)?;
                    info!(dataset_id = %dataset_id, host = hostname, "Released dataset");
                    Ok(())
                }
                // Already released, or never ours
                _ => Ok(()),
            },

            Action::DestroyDataset { dataset_id } => {
                let Some(volume) = existing else {
                    return Ok(());
                };
                match &volume.host {
                    Some(host) if host == hostname => {
                        backend.detach_volume(&volume.blockdevice_id).await.or_else(ignore_unknown)?;
                    }
                    Some(host) => {
                        return Err(Error::VolumeAttached {
                            blockdevice_id: volume.blockdevice_id.clone(),
                            host: host.clone(),
                        });
                    }
                    None => {}
                }
                backend.destroy_volume(&volume.blockdevice_id).await.or_else(ignore_unknown)?;
                info!(dataset_id = %dataset_id, "Destroyed dataset");
                Ok(())
            }

            Action::ResizeVolume { dataset_id, size } => {
                let volume = existing.ok_or_else(|| Error::unknown_volume(dataset_id.as_str()))?;
                if volume.size != *size {
                    backend.resize_volume(&volume.blockdevice_id, *size).await?;
                    info!(dataset_id = %dataset_id, from = volume.size, to = *size, "Resized dataset");
                }
                Ok(())
            }

            Action::HandoffDataset { dataset_id, from } => {
                let volume = existing.ok_or_else(|| Error::unknown_volume(dataset_id.as_str()))?;
                match &volume.host {
                    Some(host) if host != hostname => Err(Error::AwaitingRelease {
                        dataset_id: dataset_id.to_string(),
                        host: host.clone(),
                    }),
                    _ => {
                        attach_here(backend, &volume, hostname).await?;
                        info!(dataset_id = %dataset_id, from = %from, to = hostname, "Handoff complete");
                        Ok(())
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::HandoffDataset { dataset_id, from } => {
                write!(f, "{}({}, from={})", self.kind(), dataset_id, from)
            }
            Action::CreateDataset { size, .. } | Action::ResizeVolume { size, .. } => {
                write!(f, "{}({}, size={})", self.kind(), self.dataset_id(), size)
            }
            _ => write!(f, "{}({})", self.kind(), self.dataset_id()),
        }
    }
}

/// Attach a volume to `hostname` unless it already is
///
/// A volume the listing already shows on another host fails with the
/// permanent `AlreadyAttachedVolume`. An attach that loses a race after the
/// listing counts as success if the winner is this host, and otherwise
/// reports the transient `AwaitingRelease`.
async fn attach_here(backend: &dyn BlockDeviceApi, volume: &BlockDeviceVolume, hostname: &str) -> Result<()> {
    match &volume.host {
        Some(host) if host == hostname => return Ok(()),
        Some(host) => {
            return Err(Error::AlreadyAttachedVolume {
                blockdevice_id: volume.blockdevice_id.clone(),
                host: host.clone(),
            })
        }
        None => {}
    }

    match backend.attach_volume(&volume.blockdevice_id, hostname).await {
        Ok(_) => Ok(()),
        Err(Error::AlreadyAttachedVolume { host, .. }) if host == hostname => Ok(()),
        Err(Error::AlreadyAttachedVolume { host, .. }) => Err(Error::AwaitingRelease {
            dataset_id: volume.dataset_id.to_string(),
            host,
        }),
        Err(e) => Err(e),
    }
}

/// The volume vanished between listing and mutating; the goal is already met
fn ignore_unknown(e: Error) -> Result<()> {
    match e {
        Error::UnknownVolume { .. } => Ok(()),
        e => Err(e),
    }
}
