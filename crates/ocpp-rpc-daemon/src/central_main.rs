//! OCPP-J central system.
//!
//! Accepts charge points on `ws://<listen>/<anything>/<identity>` and
//! answers BootNotification, Heartbeat and StatusNotification.
//!
//!   ocpp-central --listen 0.0.0.0:8080 --strict

use clap::Parser;
use ocpp_rpc_daemon::config::DaemonConfig;
use ocpp_rpc_daemon::{central, init_tracing, log_state_changes};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ocpp-central", about = "OCPP-J central system")]
struct Args {
    /// TOML config file
    #[arg(long, env = "OCPP_CONFIG")]
    config: Option<PathBuf>,
    /// Address to listen on
    #[arg(long, env = "OCPP_LISTEN")]
    listen: Option<SocketAddr>,
    /// Validate payloads against the built-in schemas
    #[arg(long)]
    strict: bool,
    /// Heartbeat interval handed to booting stations, in seconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("ocpp_central")?;
    let args = Args::parse();

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(secs) = args.heartbeat_interval {
        config.heartbeat_interval_s = secs;
    }
    config.rpc.strict |= args.strict;

    let server = central::central_system(&config);
    tokio::spawn(log_state_changes(server.subscribe()));

    tracing::info!("Starting central system on {}", config.listen);
    tokio::select! {
        result = server.listen(config.listen) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    Ok(())
}
