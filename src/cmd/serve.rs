//! HTTP server command: `propyield serve`.

use anyhow::Result;
use std::path::PathBuf;

use propyield::config::AppConfig;
use propyield::monetize::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config: AppConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    for warning in config.toml.validate() {
        tracing::warn!("{}", warning);
    }

    let db_path = db_path.unwrap_or_else(|| config.db_path());
    let settings = config.toml;
    start_server(ServerConfig {
        host: settings.server.host.clone(),
        port: port.unwrap_or(settings.server.port),
        db_path,
        dev_mode: dev || settings.server.dev_mode,
        settings,
    })
    .await
}
