//! Central system handlers.

use crate::config::DaemonConfig;
use crate::schemas;
use chrono::{SecondsFormat, Utc};
use ocpp_rpc::{CallContext, RpcError, RpcServer};
use serde_json::json;

/// Current time the way OCPP wants it: RFC 3339, UTC, milliseconds.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A server answering boot, heartbeat and status notifications.
pub fn central_system(config: &DaemonConfig) -> RpcServer {
    let server = RpcServer::with_schemas(config.rpc.clone(), schemas::ocpp201());
    let interval = config.heartbeat_interval_s;

    server.handle("BootNotification", move |ctx: CallContext| async move {
        tracing::info!("{} booted: {}", ctx.identity, ctx.params);
        Ok::<_, RpcError>(json!({
            "status": "Accepted",
            "interval": interval,
            "currentTime": now(),
        }))
    });

    server.handle("Heartbeat", |ctx: CallContext| async move {
        tracing::debug!("Heartbeat from {}", ctx.identity);
        Ok::<_, RpcError>(json!({"currentTime": now()}))
    });

    server.handle("StatusNotification", |ctx: CallContext| async move {
        tracing::info!(
            "{} connector {}/{} is {}",
            ctx.identity,
            ctx.params["evseId"],
            ctx.params["connectorId"],
            ctx.params["connectorStatus"]
        );
        Ok::<_, RpcError>(json!({}))
    });

    server
}
