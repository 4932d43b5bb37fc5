use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use passage_bin_shared::config::{self, ClientConfig};
use passage_bin_shared::logging;
use passage_client::{ClientState, DEFAULT_IDLE_TIMEOUT, Eventloop};
use transit_stream::TransitStream;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CLIENT_CONFIG));
    let config = ClientConfig::load(&config_path)
        .with_context(|| format!("Failed to load `{}`", config_path.display()))?;

    let _guard = logging::init(
        config.log_file.as_deref(),
        cli.log_level.as_deref().or(config.log_level.as_deref()),
    )
    .context("Failed to set up logging")?;

    let idle_timeout = cli
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_IDLE_TIMEOUT);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(try_main(config, idle_timeout))
}

async fn try_main(config: ClientConfig, idle_timeout: Duration) -> Result<()> {
    let server = (config.server_addr.clone(), config.server_port);

    if config.forwards.is_empty() {
        tracing::warn!("Configuration contains no forwards");
    }

    tracing::info!("Attempting to connect {}:{}", server.0, server.1);

    let stream = tokio::net::TcpStream::connect(server.clone())
        .await
        .with_context(|| format!("Failed to connect to {}:{}", server.0, server.1))?;
    let transit = TransitStream::new(stream).context("Failed to set up transit connection")?;

    tracing::info!("Successfully connected to server {}:{}", server.0, server.1);

    // The config (token included) moves into the session core.
    let mut client = ClientState::new(config, idle_timeout);

    tokio::select! {
        result = Eventloop::new(&mut client, transit).run() => {
            result.context("Session ended")?;

            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Goodbye!");

            Ok(())
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "NAT-side endpoint of the passage port forwarder", long_about = None)]
struct Cli {
    /// Configuration file path.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Per-flow idle timeout in seconds (default 300).
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Log level (debug|info|warn|error|critical), overriding the config.
    #[arg(short = 'l', long = "level")]
    log_level: Option<String>,
}
