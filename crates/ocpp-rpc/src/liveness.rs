//! Ping/pong liveness tracking.
//!
//! Each sweep clears the alive flag and asks for a ping. A pong sets it
//! again. A peer still not alive at the following sweep is stale, so one
//! lost probe is tolerated and a full silent interval is not.

use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// Send a ping and wait for the next sweep.
    Ping,
    /// No pong since the last ping; drop the peer.
    Stale,
}

#[derive(Debug, Clone)]
pub(crate) struct Liveness {
    alive: bool,
    last_pong_at: Option<SystemTime>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            alive: true,
            last_pong_at: None,
        }
    }
}

impl Liveness {
    pub(crate) fn sweep(&mut self) -> Probe {
        if !self.alive {
            return Probe::Stale;
        }
        self.alive = false;
        Probe::Ping
    }

    pub(crate) fn on_pong(&mut self, at: SystemTime) {
        self.alive = true;
        self.last_pong_at = Some(at);
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive
    }

    pub(crate) fn last_pong_at(&self) -> Option<SystemTime> {
        self.last_pong_at
    }
}
