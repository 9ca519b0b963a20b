//! API Module
//!
//! Versioned document formats for the desired configuration and the
//! observed cluster state, with their JSON Schemas and validators.

pub mod documents;

pub use documents::*;
