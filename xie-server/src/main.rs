//! Xie collaboration server.
//!
//! Usage: `xie-server [config.json]`. Without an argument the path is taken
//! from `XIE_CONFIG`; with neither, built-in defaults are used. Logging is
//! controlled through `RUST_LOG` and defaults to `info`.

use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

use xie_collab::{AppError, CollabContext, ServerConfig};

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("XIE_CONFIG"))
        .map(PathBuf::from)
}

fn load_config() -> Result<ServerConfig, AppError> {
    match config_path() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(ServerConfig::load(&path)?)
        }
        None => {
            info!("No configuration file given; using defaults");
            Ok(ServerConfig::default())
        }
    }
}

async fn serve() -> Result<(), AppError> {
    let config = load_config()?;
    let ctx = CollabContext::start(config).await?;
    info!("Xie server ready on ws://{}", ctx.local_addr());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for Ctrl-C: {e}");
    }
    let stats = ctx.fanout_stats().await;
    info!(
        "Sent {} messages ({} dropped) to {} peers",
        stats.messages_sent, stats.messages_dropped, stats.active_peers
    );
    ctx.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Xie server...");
    match serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
