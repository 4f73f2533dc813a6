//! Field Device Controller (fieldsrv)
//!
//! Polls Modbus TCP field devices, keeps their last readings and status in
//! the store, and runs the automation engine that switches relays and raises
//! alerts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │ PollingService  │───►│ ConnectionPool  │◄───│ ActionExecutor  │
//! │ (task/device)   │    │ (queue per key) │    │ (relays, alerts)│
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                      │                      ▲
//!          ▼                      ▼                      │
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Store (SQLite) │    │  Modbus TCP     │    │   Scheduler     │
//! │  + Publisher    │    │  devices        │    │   (30s tick)    │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//! ```
//!
//! # Command Line Usage
//!
//! ```bash
//! # Start with the default configuration file (config/fieldsrv.yaml)
//! fieldsrv
//!
//! # Custom configuration and log level
//! fieldsrv --config /etc/fieldsrv.yaml --log-level debug
//!
//! # Check the configuration and exit
//! fieldsrv --validate
//! ```
//!
//! ## Environment Variables
//!
//! - `FIELDSRV_CONFIG`: configuration file path
//! - `FIELDSRV_LOG_DIR`: log root directory
//! - `FIELDSRV_<SECTION>__<KEY>`: override any configuration value, e.g.
//!   `FIELDSRV_MODBUS__TIMEOUT_MS=5000`
//! - `RUST_LOG`: tracing filter

pub mod core;
pub mod runtime;

pub use crate::core::config::ServiceConfig;
pub use crate::core::polling::{
    DeviceStateInfo, PollOutcome, PollingConfig, PollingService, RefreshReport,
};
pub use runtime::{FieldRuntime, RuntimeDeps};
