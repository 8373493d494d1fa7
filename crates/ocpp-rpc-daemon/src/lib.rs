//! Shared pieces of the `ocpp-central` and `ocpp-station` binaries.

pub mod central;
pub mod config;
pub mod schemas;
pub mod station;

use ocpp_rpc::StateChange;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber: `RUST_LOG` plus `info` for our own crates.
pub fn init_tracing(binary: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("{binary}=info").parse()?)
        .add_directive("ocpp_rpc_daemon=info".parse()?)
        .add_directive("ocpp_rpc=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Log every lifecycle transition until the channel closes.
pub async fn log_state_changes(mut events: broadcast::Receiver<StateChange>) {
    loop {
        match events.recv().await {
            Ok(change) => tracing::info!("{} is {}", change.identity, change.state),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Missed {} state changes", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
