//! OCPP-J charge point.
//!
//! Connects to a central system, boots and keeps heartbeating. Reconnects
//! on its own after the connection drops.
//!
//!   ocpp-station --endpoint ws://127.0.0.1:8080/ocpp --identity ID002

use clap::Parser;
use ocpp_rpc_daemon::config::DaemonConfig;
use ocpp_rpc_daemon::{init_tracing, log_state_changes, station};

#[derive(Parser)]
#[command(name = "ocpp-station", about = "OCPP-J charge point")]
struct Args {
    /// TOML config file
    #[arg(long, env = "OCPP_CONFIG")]
    config: Option<std::path::PathBuf>,
    /// Central system base URL
    #[arg(long, env = "OCPP_ENDPOINT")]
    endpoint: Option<String>,
    /// Charge point identity
    #[arg(long, env = "OCPP_IDENTITY")]
    identity: Option<String>,
    /// Basic auth password
    #[arg(long, env = "OCPP_PASSWORD")]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("ocpp_station")?;
    let args = Args::parse();

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(identity) = args.identity {
        config.identity = identity;
    }
    if args.password.is_some() {
        config.password = args.password;
    }

    let client = station::station_client(&config);
    tokio::spawn(log_state_changes(client.subscribe()));

    tracing::info!("Station {} dialing {}", config.identity, config.endpoint);
    tokio::select! {
        result = station::run(&client, config.heartbeat_interval()) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    client.close();
    Ok(())
}
