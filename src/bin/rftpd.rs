use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use rftp::cli::DaemonOpts;
use rftp::config::ServerConfig;
use rftp::logging::init_tracing;
use rftp::Server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);

    let config = opts.apply(ServerConfig::load(opts.config.as_deref())?);

    // Validate root directory exists and is a directory
    if !config.root.exists() {
        anyhow::bail!("Root directory does not exist: {}", config.root.display());
    }
    if !config.root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", config.root.display());
    }

    if config.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the daemon to all network interfaces");
        eprintln!("   The protocol is unencrypted and unauthenticated; only use on trusted networks");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(run(config))
}

async fn run(config: ServerConfig) -> Result<()> {
    let server = Server::bind(config).await?;
    tokio::select! {
        res = server.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
