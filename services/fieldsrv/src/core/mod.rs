//! Core service components
//!
//! - **`bootstrap`** - command line, logging initialization, configuration validation
//! - **`config`** - layered service configuration
//! - **`polling`** - per-device polling engine

pub mod bootstrap;
pub mod config;
pub mod polling;
