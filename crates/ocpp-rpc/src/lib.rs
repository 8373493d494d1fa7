//! Bidirectional OCPP-J RPC over WebSocket.
//!
//! Both sides of a connection can call and be called. [`RpcClient`] dials a
//! central system and reconnects after unexpected drops; [`RpcServer`]
//! accepts charge points and keeps a registry of who is connected. Both
//! share one connection engine: message-id correlation, per-call timeouts,
//! handler dispatch with optional schema validation, and ping/pong liveness.
//!
//! ```no_run
//! use ocpp_rpc::{CallContext, ClientOptions, RpcClient, RpcError, RpcServer, RpcConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> ocpp_rpc::Result<()> {
//! let server = RpcServer::new(RpcConfig::default());
//! server.handle("Heartbeat", |_ctx: CallContext| async {
//!     Ok::<_, RpcError>(json!({"currentTime": "2025-01-01T00:00:00Z"}))
//! });
//! tokio::spawn({
//!     let server = server.clone();
//!     async move { server.listen(([127, 0, 0, 1], 9000).into()).await }
//! });
//!
//! let client = RpcClient::new(ClientOptions::new("ws://127.0.0.1:9000/ocpp", "CP1"));
//! client.connect().await?;
//! let _reply = client.call("Heartbeat", json!({})).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod dispatch;
mod engine;
mod error;
mod liveness;
mod pending;
mod registry;
mod server;

pub use client::{ClientOptions, RpcClient};
pub use config::{CallOptions, RpcConfig};
pub use dispatch::{CallContext, HandlerResult, Reply};
pub use engine::Transport;
pub use error::{Error, Result};
pub use server::{RpcServer, ServerConnection};

pub use ocpp_rpc_core::{
    ConnectionState, Direction, ErrorCode, Frame, JsonType, PeerIdentity, RpcError, SchemaSet,
    Shape, StateChange, Validator, Violation, ViolationKind,
};
