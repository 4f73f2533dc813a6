//! Shared service plumbing for the field controller
//!
//! - logging with runtime level reload
//! - layered configuration loading
//! - shutdown signal handling
//! - startup banner and logging bootstrap

pub mod config_loader;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use anyhow;
pub use tokio;
