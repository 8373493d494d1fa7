//! Endpoint configuration.

use serde::Deserialize;
use std::time::Duration;

/// Tunables shared by client and server endpoints.
///
/// Durations are plain milliseconds so the struct reads naturally from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// WebSocket subprotocol, e.g. `ocpp2.0.1`.
    pub protocol: String,
    /// Validate payloads against the endpoint's schemas.
    pub strict: bool,
    pub call_timeout_ms: u64,
    /// Liveness probe period; `0` disables probing.
    pub ping_interval_ms: u64,
    /// Reconnect automatically after an unexpected close (client only).
    pub reconnect: bool,
    pub reconnect_delay_ms: u64,
    /// Outbound calls allowed in flight at once.
    pub call_concurrency: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            protocol: "ocpp2.0.1".to_string(),
            strict: false,
            call_timeout_ms: 30_000,
            ping_interval_ms: 30_000,
            reconnect: true,
            reconnect_delay_ms: 5_000,
            call_concurrency: 1,
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Deadline for the reply; the endpoint default when `None`.
    pub timeout: Option<Duration>,
    /// Send and return immediately without waiting for a reply.
    pub no_reply: bool,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            no_reply: false,
        }
    }

    pub fn no_reply() -> Self {
        Self {
            timeout: None,
            no_reply: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: RpcConfig =
            serde_json::from_value(serde_json::json!({"strict": true, "ping_interval_ms": 0}))
                .unwrap();
        assert!(config.strict);
        assert_eq!(config.ping_interval(), None);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.protocol, "ocpp2.0.1");
    }
}
