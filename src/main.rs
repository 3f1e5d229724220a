//! tickwire - tick-synchronized command control plane
//!
//! Runs the reference simulation host and its QUIC control endpoint until
//! ctrl-c.

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tickwire_net::ServerEndpoint;
use tickwire_server::world::WorldClock;
use tickwire_server::{builtin_registries, ControlServer, ServerConfig, Simulation, SimulationHost};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting tickwire v{}", env!("CARGO_PKG_VERSION"));

    let cli = CliOptions::parse(env::args().skip(1));
    let config = cli.resolve_config();

    let host = SimulationHost::new()?;
    let registries = Arc::new(
        builtin_registries(&host, &config).context("Failed to build registries")?,
    );
    let simulation = Simulation::spawn(Arc::clone(&host), config.tick_interval())?;
    let endpoint = ServerEndpoint::bind_with_limit(config.bind_addr, config.max_frame_bytes)?;
    let server = ControlServer::new(host, registries, config.shutdown_grace_period());

    let accept = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve(endpoint).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested");

    server.shutdown().await;
    match accept.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("Accept loop failed: {err:#}"),
        Err(err) => error!("Accept loop panicked: {err}"),
    }
    let world = simulation.stop()?;
    info!(tick = %world.resource::<WorldClock>().tick, "Simulation stopped");
    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct CliOptions {
    config: Option<PathBuf>,
    bind: Option<SocketAddr>,
    tick_rate: Option<u32>,
}

impl CliOptions {
    fn parse<I: Iterator<Item = String>>(mut args: I) -> Self {
        let mut opts = CliOptions::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    if let Some(path) = args.next() {
                        opts.config = Some(PathBuf::from(path));
                    } else {
                        error!("--config requires a file path");
                    }
                }
                "--bind" => {
                    if let Some(raw) = args.next() {
                        match raw.parse::<SocketAddr>() {
                            Ok(addr) => opts.bind = Some(addr),
                            Err(err) => {
                                error!(%err, value = %raw, "--bind must be an address like 0.0.0.0:6767");
                            }
                        }
                    } else {
                        error!("--bind requires an address");
                    }
                }
                "--tick-rate" => {
                    if let Some(raw) = args.next() {
                        match raw.parse::<u32>() {
                            Ok(0) => error!("--tick-rate must be positive"),
                            Ok(value) => opts.tick_rate = Some(value),
                            Err(err) => {
                                error!(%err, value = %raw, "--tick-rate must be an integer");
                            }
                        }
                    } else {
                        error!("--tick-rate requires an integer");
                    }
                }
                other => warn!("Ignoring unknown argument {other}"),
            }
        }

        opts
    }

    fn resolve_config(&self) -> ServerConfig {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load_from_path(path),
            None => ServerConfig::load(),
        };
        if let Some(addr) = self.bind {
            config.bind_addr = addr;
        }
        if let Some(rate) = self.tick_rate {
            config.tick_rate = rate;
        }
        config
    }
}
