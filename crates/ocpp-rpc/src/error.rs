//! Host-facing errors.

use ocpp_rpc_core::{ConnectionState, IdentityError, RpcError, Violation};
use tokio_tungstenite::tungstenite;

/// Why `connect()` or `call()` failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer answered with a CALLERROR.
    #[error("remote error: {0}")]
    Remote(#[from] RpcError),
    #[error("{action} call {message_id} timed out")]
    Timeout { action: String, message_id: String },
    /// The connection went away while the call was pending.
    #[error("connection closed before a reply arrived")]
    Disconnected,
    #[error("not connected")]
    NotConnected,
    /// The endpoint was closed by the host.
    #[error("endpoint closed")]
    Closed,
    /// A payload failed schema validation locally.
    #[error("validation failed: {0}")]
    Validation(#[from] Violation),
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
