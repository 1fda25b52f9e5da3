//! sealtun CLI - encrypted UDP tunnel client/server
//!
//! Runs either side of the tunnel from a `.conf` file, or prints a fresh
//! pre-shared key.

use std::path::PathBuf;
use std::process::ExitCode;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::Parser;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing_subscriber::{fmt, EnvFilter};

use sealtun::crypto::aead::KEY_LEN;
use sealtun::config::default_config_path;
use sealtun::error::CryptoError;
use sealtun::{Mode, SealTunError, Shutdown, TunnelClient, TunnelConfig, TunnelServer};

/// sealtun - encrypted UDP tunnel
#[derive(Parser, Debug)]
#[command(name = "sealtun")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: configs/sealtun.conf in the
    /// working directory, then next to the executable)
    #[arg(short, long, conflicts_with = "genkey")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Force server mode (overrides Mode in the config file)
    #[arg(long, conflicts_with_all = ["client", "genkey"])]
    server: bool,

    /// Force client mode (overrides Mode in the config file)
    #[arg(long, conflicts_with_all = ["server", "genkey"])]
    client: bool,

    /// Print a new random PreSharedKey and exit
    #[arg(long)]
    genkey: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging; RUST_LOG wins over -v
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), SealTunError> {
    if args.genkey {
        println!("{}", generate_key()?);
        return Ok(());
    }

    let config_path = match args.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };
    tracing::info!("Loading configuration from: {}", config_path.display());

    let mut config = TunnelConfig::from_file(&config_path)?;
    if let Some(mode) = mode_override(&args) {
        tracing::info!("Mode forced to {} from the command line", mode);
        config = config.with_mode(mode)?;
    }

    match config.tunnel.mode {
        Mode::Client => {
            tracing::info!("sealtun client starting...");
            let mut client = TunnelClient::new(config);
            watch_signals(client.shutdown_handle());

            match client.start().await {
                Ok(()) => client.closed().await,
                Err(e) if e.is_cancelled() => {
                    tracing::info!("Shutdown requested before the tunnel came up");
                }
                Err(e) => {
                    client.stop().await;
                    return Err(e);
                }
            }
            client.stop().await;
        }
        Mode::Server => {
            tracing::info!("sealtun server starting...");
            let mut server = TunnelServer::new(config);
            watch_signals(server.shutdown_handle());

            if let Err(e) = server.start().await {
                server.stop().await;
                return Err(e);
            }
            server.closed().await;
            server.stop().await;
        }
    }

    Ok(())
}

/// Mode from `--client` / `--server`, if given
fn mode_override(args: &Args) -> Option<Mode> {
    if args.server {
        Some(Mode::Server)
    } else if args.client {
        Some(Mode::Client)
    } else {
        None
    }
}

/// Trigger `shutdown` on Ctrl+C or SIGTERM
fn watch_signals(shutdown: Shutdown) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }

        shutdown.trigger();
    });
}

/// Fresh base64 PreSharedKey from the OS random source
fn generate_key() -> Result<String, SealTunError> {
    let mut key = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(|e| CryptoError::Randomness {
            reason: e.to_string(),
        })?;
    Ok(BASE64.encode(key))
}
