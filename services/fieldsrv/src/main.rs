//! Field Device Controller (fieldsrv)

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use field_modbus::TcpConnector;
use field_store::{BroadcastPublisher, SqliteStore};
use fieldsrv::core::bootstrap::{self, Args};
use fieldsrv::{FieldRuntime, RuntimeDeps, ServiceConfig};

/// Buffered events per subscriber before the oldest are dropped
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let service_info = bootstrap::service_info();

    let config = ServiceConfig::load(Some(&args.config))
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    bootstrap::initialize_logging(&args, &service_info, &config)?;
    if !args.no_color {
        common::service_bootstrap::print_startup_banner(&service_info);
    }

    // Validation mode: validate and exit
    if args.validate {
        bootstrap::validate_configuration(&config)?;
        info!("Validation completed successfully");
        return Ok(());
    }
    config.validate()?;

    info!("Opening database {}", config.database.url);
    let store = SqliteStore::connect(&config.database.url)
        .await
        .with_context(|| format!("opening database {}", config.database.url))?;

    let runtime = FieldRuntime::start(
        &config,
        RuntimeDeps {
            store: Arc::new(store),
            connector: Arc::new(TcpConnector),
            publisher: Arc::new(BroadcastPublisher::new(EVENT_CHANNEL_CAPACITY)),
            run_log_root: Some(common::logging::get_log_root()),
        },
    )
    .await?;

    info!("fieldsrv ready, press Ctrl+C to stop");
    common::shutdown::wait_for_shutdown().await;
    info!("Shutdown signal received");

    runtime.stop().await;
    info!("fieldsrv stopped");
    Ok(())
}
