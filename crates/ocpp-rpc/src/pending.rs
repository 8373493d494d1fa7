//! Outbound calls awaiting a reply.
//!
//! Each entry owns the sending half of a oneshot. Completing an entry always
//! removes it from the map under the lock, so whichever of resolve, reject,
//! sweep or disconnect gets there first wins and the others are no-ops.

use crate::error::Error;
use ocpp_rpc_core::{RpcError, SchemaSet};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type CallOutcome = Result<Value, Error>;

struct PendingCall {
    action: String,
    deadline: Instant,
    slot: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    fn complete(self, outcome: CallOutcome) {
        // The caller may have stopped waiting.
        let _ = self.slot.send(outcome);
    }
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a new call. Fails if the id is already in flight.
    pub(crate) fn register(
        &self,
        message_id: &str,
        action: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<CallOutcome>, Error> {
        let mut calls = self.lock();
        if calls.contains_key(message_id) {
            return Err(Error::InvalidRequest(format!(
                "message id {message_id} is already pending"
            )));
        }
        let (slot, rx) = oneshot::channel();
        calls.insert(
            message_id.to_string(),
            PendingCall {
                action: action.to_string(),
                deadline,
                slot,
            },
        );
        Ok(rx)
    }

    /// Drop an entry without completing it (the call never went out).
    pub(crate) fn discard(&self, message_id: &str) {
        self.lock().remove(message_id);
    }

    /// Complete with a CALLRESULT payload, validating it first when schemas
    /// are given. Returns `false` for an unknown id.
    pub(crate) fn resolve(
        &self,
        message_id: &str,
        payload: Value,
        schemas: Option<&SchemaSet>,
    ) -> bool {
        let Some(call) = self.lock().remove(message_id) else {
            return false;
        };
        let outcome = match schemas.map(|s| s.validate_response(&call.action, &payload)) {
            Some(Err(violation)) => Err(Error::Validation(violation)),
            _ => Ok(payload),
        };
        call.complete(outcome);
        true
    }

    /// Complete with a CALLERROR. Returns `false` for an unknown id.
    pub(crate) fn reject(&self, message_id: &str, error: RpcError) -> bool {
        let Some(call) = self.lock().remove(message_id) else {
            return false;
        };
        call.complete(Err(Error::Remote(error)));
        true
    }

    /// Fail every entry whose deadline is at or before `now`.
    pub(crate) fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(String, PendingCall)> = {
            let mut calls = self.lock();
            let ids: Vec<String> = calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| calls.remove(&id).map(|call| (id, call)))
                .collect()
        };

        let count = expired.len();
        for (message_id, call) in expired {
            let action = call.action.clone();
            call.complete(Err(Error::Timeout { action, message_id }));
        }
        count
    }

    /// Fail everything with `Disconnected`.
    pub(crate) fn reject_all(&self) -> usize {
        let drained: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            call.complete(Err(Error::Disconnected));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
