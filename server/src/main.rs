use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use passage_bin_shared::config::{self, ServerConfig};
use passage_bin_shared::logging;
use passage_server::{Eventloop, Server};
use rand::rngs::OsRng;
use transit_stream::TransitStream;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_SERVER_CONFIG));
    let config = ServerConfig::load(&config_path)
        .with_context(|| format!("Failed to load `{}`", config_path.display()))?;

    let _guard = logging::init(
        config.log_file.as_deref(),
        cli.log_level.as_deref().or(config.log_level.as_deref()),
    )
    .context("Failed to set up logging")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(try_main(config))
}

async fn try_main(config: ServerConfig) -> Result<()> {
    let bind_addr = SocketAddr::new(config.bind_addr, config.bind_port);
    let listener = make_listener(bind_addr)
        .with_context(|| format!("Failed to bind transit listener on {bind_addr}"))?;

    // The config no longer holds the token from here on.
    let mut server = Server::new(config.token, OsRng);

    tracing::info!("Waiting for client connection...");
    tracing::info!("Listening for {bind_addr}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted.context("Transit listener failed")?;
                tracing::info!("Successfully connected to client {addr}");

                let transit = match TransitStream::new(stream) {
                    Ok(transit) => transit,
                    Err(e) => {
                        tracing::warn!("Failed to set up transit connection: {e}");
                        continue;
                    }
                };

                // Sessions run serially: at most one transit client at a time.
                match Eventloop::new(&mut server, transit).run().await {
                    Ok(()) => tracing::info!("Session ended, waiting for the next client"),
                    Err(e) => tracing::warn!("Session failed ({e}), waiting for the next client"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Goodbye!");
                return Ok(());
            }
        }
    }
}

fn make_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
        SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;

    Ok(socket.listen(16)?)
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Public endpoint of the passage port forwarder", long_about = None)]
struct Cli {
    /// Configuration file path.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log level (debug|info|warn|error|critical), overriding the config.
    #[arg(short = 'l', long = "level")]
    log_level: Option<String>,
}
