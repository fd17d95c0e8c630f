//! Runs the sandboxed execution dispatcher as an HTTP service.

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;
use safexec_core::{ConfigLoader, Dispatcher, ProviderKind, ServiceConfig};
use safexec_server::{shutdown_signal, SafexecServer, ServerConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "safexec - run untrusted code in throwaway containers")]
struct Cli {
    #[clap(long, short, help = "YAML configuration file; built-in defaults when omitted")]
    config: Option<PathBuf>,

    #[clap(long, default_value = "127.0.0.1:5000")]
    bind_addr: String,

    #[clap(long, short, help = "Log level filter; overrides logging.level from the config file")]
    log_level: Option<String>,

    #[clap(long, help = "Isolation runtime: 'docker' (Engine API) or 'cli' (docker run)")]
    provider: Option<ProviderKind>,

    #[clap(long, help = "Persist execution history to this JSON file")]
    history_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path).await?,
        None => ServiceConfig::default(),
    };

    // Initialize logger
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    if let Some(provider) = cli.provider {
        config.execution.provider = provider;
    }
    if let Some(path) = cli.history_file {
        config.history.path = Some(path);
    }

    let dispatcher = Dispatcher::from_config(&config)?;

    let bind_socket_addr: SocketAddr = cli
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", cli.bind_addr, e))?;
    // Multipart framing on top of the largest accepted archive.
    let max_body_size = config.execution.max_archive_bytes as usize + 1024 * 1024;
    let server_config = ServerConfig::default()
        .with_bind_addr(bind_socket_addr)
        .with_max_body_size(max_body_size)
        .with_logging(true);

    let server = SafexecServer::with_config(Arc::new(dispatcher), server_config);
    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<ServiceConfig> {
    let config = ConfigLoader::from_file(path).await?;
    Ok(config)
}
