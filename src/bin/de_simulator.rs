//! Simulated DE server
//!
//! Usage: `de_simulator [PORT] [CONFIG.json]`
//!
//! Listens on TCP and UDP at PORT (default 13241). The optional JSON file
//! holds a `SimulatorConfig`; its bind address is kept but the port from the
//! command line wins. Log verbosity comes from `RUST_LOG`.

use std::net::SocketAddr;

use deapi::io::AsyncSimulatorServer;
use deapi::logging::{self, LogConfig};
use deapi::simulator::{Simulator, SimulatorConfig};
use deapi::{DeError, Result};
use tracing::{error, info};

const DEFAULT_PORT: u16 = 13241;

fn parse_args() -> Result<(u16, Option<String>)> {
    let mut args = std::env::args().skip(1);
    let port = match args.next() {
        Some(arg) => arg
            .parse()
            .map_err(|_| DeError::InvalidParameter(format!("invalid port `{}`", arg)))?,
        None => DEFAULT_PORT,
    };
    Ok((port, args.next()))
}

fn bind_addr(config: &SimulatorConfig, port: u16) -> String {
    match config.bind_addr.parse::<SocketAddr>() {
        Ok(mut addr) => {
            addr.set_port(port);
            addr.to_string()
        }
        Err(_) => format!("127.0.0.1:{}", port),
    }
}

async fn run() -> Result<()> {
    let (port, config_path) = parse_args()?;
    let config = match config_path {
        Some(path) => {
            info!(path = %path, "Loading simulator config");
            SimulatorConfig::from_json_file(path)?
        }
        None => SimulatorConfig::default(),
    };
    let addr = bind_addr(&config, port);

    let simulator = Simulator::new(config)?;
    info!(
        camera = simulator.camera_name(),
        properties = simulator.properties().len(),
        "Simulator ready"
    );
    let server = AsyncSimulatorServer::bind(&addr, simulator.into_shared()).await?;

    tokio::select! {
        result = server.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    logging::init(&LogConfig::default());
    if let Err(e) = run().await {
        error!(error = %e, "Simulator failed");
        std::process::exit(1);
    }
}
