use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::{error, info};

use procq_core::logging::init_logging;
use procq_core::AppConfig;

mod app;
mod shutdown;

use app::Application;
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("procq")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Processor task creation and scheduling engine")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config/procq.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level, overrides the configured one")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log output format")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = AppConfig::load(Path::new(config_path))
        .with_context(|| format!("loading configuration from {config_path}"))?;

    let level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.log.level);
    let json = matches.get_one::<String>("log-format").map(String::as_str) == Some("json");
    init_logging(level, json);

    info!(config = %config_path, "starting procq");

    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("application failed: {e:#}");
            }
        })
    };

    shutdown::wait_for_signal().await;
    info!("shutting down");
    shutdown_manager.trigger();

    app_handle.await.context("waiting for the main loop")?;
    info!("shutdown complete");
    Ok(())
}
