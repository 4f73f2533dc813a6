//! Service bootstrap
//!
//! Command-line arguments, logging initialization and the `--validate` mode.

use std::path::PathBuf;

use clap::Parser;
use common::service_bootstrap::{LoggingOptions, ServiceInfo};
use errors::{FieldError, FieldResult};
use tracing::{debug, info};

use crate::core::config::{ServiceConfig, DEFAULT_CONFIG_PATH};

/// Command-line arguments for fieldsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fieldsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Field Device Controller",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "FIELDSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

pub fn service_info() -> ServiceInfo {
    ServiceInfo::new(
        "fieldsrv",
        env!("CARGO_PKG_VERSION"),
        "Field Device Controller - Modbus TCP polling and automation",
    )
}

/// Initialize logging from arguments and configuration.
///
/// Log root directory priority:
/// 1. FIELDSRV_LOG_DIR environment variable
/// 2. `logging.dir` from the configuration
/// 3. Default "logs"
pub fn initialize_logging(
    args: &Args,
    service: &ServiceInfo,
    config: &ServiceConfig,
) -> FieldResult<()> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(config.logging.level.as_str());

    let options = LoggingOptions {
        dir: config.logging.dir.as_deref(),
        level: Some(level),
        json: config.logging.json,
        no_color: args.no_color,
        max_files: Some(config.logging.max_files),
    };

    common::service_bootstrap::init_logging(service, &options)
        .map_err(|e| FieldError::Configuration(format!("Failed to init logging: {}", e)))
}

/// Validate the loaded configuration and log a summary
pub fn validate_configuration(config: &ServiceConfig) -> FieldResult<()> {
    debug!("Validating configuration");
    config.validate()?;

    info!("Database: {}", config.database.url);
    info!(
        "Modbus: timeout {} ms, {} retries, pool max {}",
        config.modbus.timeout_ms, config.modbus.retries, config.modbus.max_connections
    );
    info!(
        "Polling: default {} ms, backoff {}..{} ms",
        config.polling.default_interval_ms,
        config.polling.backoff_base_ms,
        config.polling.backoff_cap_ms
    );
    info!(
        "Automation: {} (tick {} s)",
        if config.automation.enabled { "enabled" } else { "disabled" },
        config.automation.tick_secs
    );
    info!("History retention: {} days", config.history.retention_days);

    info!("Configuration validation completed successfully");
    Ok(())
}
