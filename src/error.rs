//! Error types for the Dataset Convergence Agent
//!
//! Provides structured error types for the block-device backends, the
//! deployer, the action executor and the document boundary.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the agent
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Block Device Errors
    // =========================================================================
    #[error("Unknown volume: {blockdevice_id}")]
    UnknownVolume { blockdevice_id: String },

    #[error("Volume {blockdevice_id} is already attached to {host}")]
    AlreadyAttachedVolume { blockdevice_id: String, host: String },

    #[error("Volume {blockdevice_id} is not attached")]
    VolumeNotAttached { blockdevice_id: String },

    #[error("Volume {blockdevice_id} is still attached to {host}")]
    VolumeAttached { blockdevice_id: String, host: String },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendError {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Insufficient capacity: requested {requested} bytes, available {available} bytes")]
    InsufficientCapacity { requested: u64, available: u64 },

    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Backend operation timed out after {duration:?}: {operation}")]
    Timeout { operation: String, duration: Duration },

    // =========================================================================
    // Convergence Errors
    // =========================================================================
    #[error("Dataset {dataset_id} is still attached to {host}, awaiting release")]
    AwaitingRelease { dataset_id: String, host: String },

    #[error("Dataset {dataset_id} is primary on more than one node: {hosts:?}")]
    DuplicatePrimary { dataset_id: String, hosts: Vec<String> },

    #[error("Action failed for dataset {dataset_id} after {attempts} attempts: {reason}")]
    ActionFailed {
        dataset_id: String,
        attempts: u32,
        reason: String,
    },

    // =========================================================================
    // Document Errors
    // =========================================================================
    #[error("Document validation failed: {0}")]
    Validation(String),

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take when an error surfaces during a convergence pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after a specific duration
    RetryAfter(Duration),
    /// Fail permanently; a later pass will recompute
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::BackendUnavailable { .. }
            | Error::Timeout { .. }
            | Error::AwaitingRelease { .. } => ErrorAction::RetryWithBackoff,

            Error::Io(e) if is_transient_io(e) => ErrorAction::RetryWithBackoff,

            // Capacity may free up once other datasets are destroyed
            Error::InsufficientCapacity { .. } => {
                ErrorAction::RetryAfter(Duration::from_secs(60))
            }

            // Structural and validation errors - don't retry automatically
            _ => ErrorAction::NoRetry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient and should be retried within an action
    pub fn is_transient(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryWithBackoff)
    }

    /// Short machine-readable label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Internal(_) => "internal",
            Error::Configuration(_) => "configuration",
            Error::UnknownVolume { .. } => "unknown_volume",
            Error::AlreadyAttachedVolume { .. } => "already_attached",
            Error::VolumeNotAttached { .. } => "not_attached",
            Error::VolumeAttached { .. } => "still_attached",
            Error::BackendError { .. } => "backend",
            Error::InsufficientCapacity { .. } => "capacity",
            Error::BackendUnavailable { .. } => "unavailable",
            Error::Timeout { .. } => "timeout",
            Error::AwaitingRelease { .. } => "awaiting_release",
            Error::DuplicatePrimary { .. } => "duplicate_primary",
            Error::ActionFailed { .. } => "action_failed",
            Error::Validation(_) => "validation",
            Error::CapacityParse(_) => "capacity_parse",
            Error::JsonParse(_) => "json",
            Error::YamlParse(_) => "yaml",
            Error::Io(_) => "io",
        }
    }

    pub(crate) fn unknown_volume(blockdevice_id: impl Into<String>) -> Self {
        Error::UnknownVolume {
            blockdevice_id: blockdevice_id.into(),
        }
    }
}

fn is_transient_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}

/// Result type alias for the agent
pub type Result<T> = std::result::Result<T, Error>;
