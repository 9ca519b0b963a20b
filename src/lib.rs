//! Dataset Convergence Agent
//!
//! Per-node agent that manages the lifecycle of block-device backed
//! datasets and converges each node towards a desired deployment.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            Convergence Loop                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Configuration  │  │  Cluster State  │  │         Deployer            │  │
//! │  │     Store       │  │    Service      │  │   (calculate_changes)       │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │                                             │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │    Action Executor    │                                │
//! │                    │ (per-dataset locking) │                                │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                        Block Device Backends                                 │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │          Loopback           │  │              Memory                 │   │
//! │  │   (files on a local disk)   │  │       (in-process table)            │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Backends, change calculation, execution and the loop
//! - [`config`]: Agent configuration and capacity parsing
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use config::{parse_capacity, AgentConfig};

pub use controlplane::{
    Action, ActionExecutor, AgentMetrics, BackendConfig, BackendFactory, ClusterStateEvent,
    ClusterStateService, ConvergenceLoop, Deployer, ExecutorConfig, FileConfigurationStore,
    InMemoryConfigurationStore, LoopbackBlockDeviceApi, LoopbackConfig, MemoryBlockDeviceApi,
    MemoryConfig, PassReport, PassSummary,
};

pub use domain::model::{
    ClusterState, Dataset, DatasetId, Deployment, Manifestation, Node, NodeState,
};

pub use domain::ports::{
    BlockDeviceApi, BlockDeviceApiRef, BlockDeviceVolume, ConfigurationStore, ConfigurationStoreRef,
};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
