//! Charge point loop: boot, then heartbeat at the interval the central
//! system hands out. Boots again after every reconnect.

use crate::config::DaemonConfig;
use crate::schemas;
use ocpp_rpc::{ClientOptions, ConnectionState, RpcClient};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

/// Wait between failed boot attempts.
const BOOT_RETRY: Duration = Duration::from_secs(10);

pub fn station_client(config: &DaemonConfig) -> RpcClient {
    let mut options = ClientOptions::new(config.endpoint.as_str(), config.identity.as_str())
        .config(config.rpc.clone())
        .schemas(schemas::ocpp201());
    if let Some(password) = &config.password {
        options = options.password(password.as_str());
    }
    RpcClient::new(options)
}

fn boot_request() -> Value {
    json!({
        "reason": "PowerUp",
        "chargingStation": {"model": "L2", "vendorName": "Vega"}
    })
}

/// Send BootNotification until accepted. Returns the heartbeat interval.
pub async fn boot(client: &RpcClient, fallback: Duration) -> Duration {
    loop {
        match client.call("BootNotification", boot_request()).await {
            Ok(reply) => {
                let interval = reply["interval"]
                    .as_u64()
                    .filter(|secs| *secs > 0)
                    .map_or(fallback, Duration::from_secs);
                let status = reply["status"].as_str().unwrap_or("Rejected");
                tracing::info!("Boot {} (heartbeat every {:?})", status, interval);
                if status == "Accepted" {
                    return interval;
                }
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                tracing::warn!("BootNotification failed: {}", e);
                tokio::time::sleep(BOOT_RETRY.min(fallback)).await;
            }
        }
    }
}

/// Connect and keep the station alive until the client is dropped.
pub async fn run(client: &RpcClient, fallback: Duration) -> anyhow::Result<()> {
    let fallback = fallback.max(Duration::from_secs(1));
    client.connect().await?;
    let mut events = client.subscribe();

    let mut interval = boot(client, fallback).await;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                match client.call("Heartbeat", json!({})).await {
                    Ok(reply) => {
                        tracing::debug!("Heartbeat acknowledged at {}", reply["currentTime"]);
                    }
                    Err(e) => tracing::warn!("Heartbeat failed: {}", e),
                }
            }
            change = events.recv() => {
                match change {
                    Ok(change) if change.state == ConnectionState::Open => {
                        interval = boot(client, interval).await;
                        heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
                    }
                    Ok(change) => tracing::debug!("Connection {}", change.state),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Missed {} state changes", skipped);
                    }
                    Err(RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}
