//! Control Plane Module
//!
//! The per-node agent that converges local block devices towards the
//! desired deployment: backends, change calculation, action execution,
//! cluster state aggregation and the loop that ties them together.

pub mod actions;
pub mod api;
pub mod backends;
pub mod cluster_state;
pub mod config_store;
pub mod convergence;
pub mod deployer;
pub mod executor;
pub mod metrics;

pub use actions::*;
pub use backends::*;
pub use cluster_state::*;
pub use config_store::*;
pub use convergence::*;
pub use deployer::*;
pub use executor::*;
pub use metrics::*;
