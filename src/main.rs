//! Wharfd — the coordination broker for a small container platform.
//!
//! Wires the transport, the inspection endpoint and the broker loop
//! together and runs until the process is told to stop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use wharfd::broker::Broker;
use wharfd::bus::{transport, BusSender};
use wharfd::controller::{dns::SystemResolver, inspect};
use wharfd::Config;

#[derive(Parser, Debug)]
#[command(name = "wharfd", version, about = "Container platform coordination broker")]
struct Cli {
    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the state directory.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Override the bus listening socket.
    #[arg(long)]
    bus_socket: Option<PathBuf>,

    /// Override the inspection endpoint port.
    #[arg(long)]
    inspect_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = cli.config.or_else(Config::default_path);
    let mut cfg = Config::load(config_path.as_deref())?;
    if let Some(state_dir) = cli.state_dir {
        cfg.state_dir = state_dir;
    }
    if let Some(bus_socket) = cli.bus_socket {
        cfg.bus_socket = bus_socket;
    }
    if let Some(port) = cli.inspect_port {
        cfg.inspect_port = port;
    }

    let (bus, outbound_rx) = BusSender::channel();
    let (bus_events_tx, bus_events_rx) = mpsc::unbounded_channel();
    let (loop_events_tx, loop_events_rx) = mpsc::unbounded_channel();

    let resolver = Arc::new(SystemResolver::new().context("starting the DNS resolver")?);
    let broker = Broker::new(cfg.clone(), bus, loop_events_tx.clone(), resolver)?;

    inspect::spawn(cfg.inspect_port, loop_events_tx);

    let socket_path = cfg.bus_socket.clone();
    tokio::spawn(async move {
        if let Err(e) = transport::serve(socket_path, bus_events_tx, outbound_rx).await {
            log::error!("bus transport failed: {e:#}");
        }
    });

    broker.run(bus_events_rx, loop_events_rx).await
}
