//! Domain layer - Value types and port definitions
//!
//! This module defines the data model and the core traits (ports) that
//! adapters implement, following hexagonal architecture principles.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
