//! Webhook server command (`dockhand serve`).

use std::path::Path;

use anyhow::Result;
use tracing::info;

use dockhand::config::{DockhandConfig, LogFormat};
use dockhand::deploy::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config_path: &Path,
    port: Option<u16>,
    dev: bool,
    log_format: Option<LogFormat>,
    verbose: bool,
) -> Result<()> {
    let mut config = DockhandConfig::resolve(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if dev {
        config.server.dev_mode = true;
    }
    if let Some(format) = log_format {
        config.logging.format = format;
    }

    let _guard = dockhand::logging::init_tracing(
        config.logging.format,
        config.logging.dir.as_deref(),
        verbose,
    )?;

    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    info!(
        config = %config_path.display(),
        port = config.server.port,
        base_domain = %config.proxy.base_domain,
        projects_dir = %config.workspace.projects_dir.display(),
        "configuration loaded"
    );

    start_server(ServerConfig::from_config(&config)).await
}
