// radx-common - Shared types, errors and configuration for the radx client
//
// This crate defines the caller-visible error taxonomy, the object/pool value
// types, and the cluster configuration consumed by a Connection.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use types::*;
