//! Service startup helpers: banner and logging initialization

use crate::logging::{self, LogConfig};
use tracing::info;

/// Service metadata for startup
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

impl ServiceInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

/// Logging options as they appear in service configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions<'a> {
    pub dir: Option<&'a str>,
    pub level: Option<&'a str>,
    pub json: bool,
    pub no_color: bool,
    pub max_files: Option<usize>,
}

pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
 ███████╗██╗███████╗██╗     ██████╗
 ██╔════╝██║██╔════╝██║     ██╔══██╗
 █████╗  ██║█████╗  ██║     ██║  ██║
 ██╔══╝  ██║██╔══╝  ██║     ██║  ██║
 ██║     ██║███████╗███████╗██████╔╝
 ╚═╝     ╚═╝╚══════╝╚══════╝╚═════╝
    "#;

    info!("{}", banner);
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!("");
}

/// Initialize logging for a service.
///
/// The log root is resolved once (`FIELDSRV_LOG_DIR` > `options.dir` >
/// `"logs"`) and the service writes to `{log_root}/{service}/`.
pub fn init_logging(service: &ServiceInfo, options: &LoggingOptions<'_>) -> anyhow::Result<()> {
    logging::init_log_root(options.dir);

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: logging::get_log_root().join(&service.name),
        default_filter: options.level.unwrap_or("info").to_string(),
        enable_json: options.json,
        ansi: !options.no_color,
        max_log_files: options.max_files.unwrap_or(30),
    };

    logging::init_with_config(log_config)
}
