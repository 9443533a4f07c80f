pub mod config;
pub mod engine;
pub mod history;
pub mod intent;
pub mod savings;
pub mod sleep;
pub mod store;
pub mod web;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use crate::config::ServerConfig;
use crate::engine::EngineState;
use crate::store::Store;
use crate::web::{create_web_server, WebState};

#[derive(Debug, Parser)]
#[command(name = "heat-server", about = "Space heater and battery coordination server")]
struct Cli {
    /// TOML config file. Falls back to $HEAT_SERVER_CONFIG, then built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `server.listen`.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Overrides `server.state_path`.
    #[arg(long)]
    state: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    heat_protocol::logging::init();
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(state) = cli.state {
        config.server.state_path = state;
    }

    let store = Store::new(&config.server.state_path);
    let engine: EngineState = store.load()?.into();
    info!(
        state = %store.path().display(),
        timezone = %config.tariff.timezone,
        target_temp_f = engine.intent.target_temp_f,
        automation_mode = %engine.settings.automation_mode,
        "loaded state"
    );

    create_web_server(WebState::new(config, store, engine)).await
}
