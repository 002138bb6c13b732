//! Configuration loading.
//!
//! See [`global`] for the file format and location rules.

pub mod global;

pub use global::{ComponentToggles, GlobalConfig, NetworkConfig, UpgradeConfig};
