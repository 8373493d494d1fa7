//! Core types for OCPP-J RPC.
//!
//! This crate holds the transport-free pieces: the three-frame wire codec,
//! the error taxonomy, the schema validation adapter and peer identity.
//! The async engine lives in `ocpp-rpc`.

mod error;
mod frame;
mod identity;
mod validation;

pub use error::{ErrorCode, RpcError};
pub use frame::{Call, CallError, CallResult, Frame, FrameError, MessageType};
pub use identity::{IdentityError, PeerIdentity};
pub use validation::{
    Direction, JsonType, SchemaSet, Shape, Validator, Violation, ViolationKind, schema_key,
};

use std::fmt;
use std::time::SystemTime;

/// Connection lifecycle state.
///
/// `Closed -> Connecting` (a scheduled reconnect) is the only edge that
/// forms a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Never connected, or the first attempt failed.
    Disconnected,
    /// Transport is opening.
    Connecting,
    /// Frames flow in both directions.
    Open,
    /// Transport is going away.
    Closing,
    /// Transport is gone.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Identity of the peer (server side) or of this station (client side).
    pub identity: String,
    pub state: ConnectionState,
    pub at: SystemTime,
}
