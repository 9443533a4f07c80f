mod bridge;
mod config;
mod device;
mod exchange;
mod reconcile;
mod sim;

use anyhow::{Context, Result};
use clap::Parser;
use heat_protocol::sync::SyncClient;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bridge::BridgeConnector;
use crate::config::DriverConfig;
use crate::device::{DeviceConnector, DeviceKind};
use crate::reconcile::{DeviceSlot, ReconcileConfig, Reconciler};
use crate::sim::{SimConnector, SimWorld};

#[derive(Debug, Parser)]
#[command(name = "heat-driver", about = "Polls heater, plug and battery and applies server targets")]
struct Cli {
    /// TOML config file. Falls back to $HEAT_DRIVER_CONFIG, then built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Polling period in seconds.
    #[arg(long)]
    period: Option<f64>,

    /// Target server base URL.
    #[arg(long)]
    server_url: Option<String>,

    /// Drive in-process simulated devices instead of the configured bridges.
    #[arg(long)]
    simulate: bool,
}

fn build_slots(config: &DriverConfig, simulate: bool) -> Vec<DeviceSlot> {
    let world = Arc::new(Mutex::new(SimWorld::default()));
    let mut slots = Vec::new();
    for kind in DeviceKind::ALL {
        let connector: Box<dyn DeviceConnector> = if simulate {
            Box::new(SimConnector::new(kind, world.clone()))
        } else {
            match config.devices.get(kind).url.as_deref() {
                Some(url) => Box::new(BridgeConnector::new(url, config.device_timeout())),
                None => {
                    warn!(device = %kind, "no bridge url configured, device not driven");
                    continue;
                }
            }
        };
        slots.push(DeviceSlot::new(kind, connector, config.devices.read_every(kind)));
    }
    slots
}

#[tokio::main]
async fn main() -> Result<()> {
    heat_protocol::logging::init();
    let cli = Cli::parse();

    let mut config = DriverConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(period) = cli.period {
        config.period_secs = period;
    }
    if let Some(url) = cli.server_url {
        config.server_url = url;
    }
    config.validate()?;

    let client = SyncClient::new(&config.server_url, config.exchange_timeout())?;
    let slots = build_slots(&config, cli.simulate);
    let mut reconciler = Reconciler::new(
        slots,
        client,
        ReconcileConfig {
            reconnect_interval: config.reconnect_interval,
            failure_threshold: config.failure_threshold,
            device_timeout: config.device_timeout(),
            exchange_timeout: config.exchange_timeout(),
        },
    );
    let connected = reconciler.start().await;
    info!(
        server = %config.server_url,
        period_secs = config.period_secs,
        reconnect_interval = config.reconnect_interval,
        simulate = cli.simulate,
        ?connected,
        "starting driver loop"
    );

    // Shutdown is only observed between cycles so writes are never cut short.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!("cannot listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    let period = config.period();
    while !*shutdown_rx.borrow() {
        let started = Instant::now();
        let report = reconciler.run_cycle().await;
        let elapsed = started.elapsed();
        debug!(
            cycle = report.cycle,
            reads_ok = report.reads_ok.len(),
            reads_failed = report.reads_failed.len(),
            writes = report.writes.len(),
            write_failures = report.write_failures,
            reconnected = ?report.reconnected,
            dropped = ?report.dropped,
            channels = reconciler.slate().len(),
            exchange = ?report.exchange,
            elapsed_ms = elapsed.as_millis() as u64,
            "cycle done"
        );

        match period.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            _ => warn!(
                cycle = report.cycle,
                elapsed_ms = elapsed.as_millis() as u64,
                "cycle overran the polling period"
            ),
        }
    }

    for kind in DeviceKind::ALL {
        if let Some(slot) = reconciler.slot(kind) {
            info!(device = %kind, state = ?slot.state(), failures = slot.failures(), "final device state");
        }
    }
    info!(cycles = reconciler.cycle(), "shutting down");
    Ok(())
}
