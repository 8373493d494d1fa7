//! Inbound call dispatch.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use ocpp_rpc_core::{Call, Frame, RpcError, SchemaSet};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

/// What a handler sees for one inbound CALL.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Identity of the peer that sent the call.
    pub identity: String,
    pub message_id: String,
    pub action: String,
    pub params: Value,
}

/// A handler's answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Send this payload back as a CALLRESULT.
    Value(Value),
    /// Send nothing; the peer is not waiting for an answer.
    Suppressed,
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

pub type HandlerResult = Result<Reply, RpcError>;

type Handler = Arc<dyn Fn(CallContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Action name to handler. At most one handler per action; the last
/// registration wins.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: RwLock<HashMap<String, Handler>>,
    fallback: Option<Arc<HandlerTable>>,
}

impl HandlerTable {
    /// A table that defers to `fallback` for actions it does not know.
    pub(crate) fn with_fallback(fallback: Arc<HandlerTable>) -> Self {
        Self {
            handlers: RwLock::default(),
            fallback: Some(fallback),
        }
    }

    pub(crate) fn insert<F, Fut, R>(&self, action: &str, handler: F)
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
        R: Into<Reply>,
    {
        let handler: Handler = Arc::new(move |ctx: CallContext| {
            let fut = handler(ctx);
            async move { fut.await.map(Into::<Reply>::into) }.boxed()
        });
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(action.to_string(), handler);
    }

    pub(crate) fn remove(&self, action: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(action)
            .is_some()
    }

    fn get(&self, action: &str) -> Option<Handler> {
        let own = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(action)
            .cloned();
        own.or_else(|| self.fallback.as_ref().and_then(|f| f.get(action)))
    }
}

/// Run one inbound call and build the reply frame, if any.
///
/// Never fails: every problem becomes a CALLERROR for the peer. `schemas`
/// is `None` when validation is off.
pub(crate) async fn dispatch(
    table: &HandlerTable,
    schemas: Option<&SchemaSet>,
    identity: &str,
    call: Call,
) -> Option<Frame> {
    let Call {
        message_id,
        action,
        payload,
    } = call;

    let Some(handler) = table.get(&action) else {
        tracing::debug!("{} called unhandled action {}", identity, action);
        return Some(Frame::error(message_id, RpcError::not_implemented(&action)));
    };

    if let Some(schemas) = schemas
        && let Err(violation) = schemas.validate_request(&action, &payload)
    {
        tracing::warn!("Rejecting {} from {}: {}", action, identity, violation);
        return Some(Frame::error(message_id, violation.into()));
    }

    let ctx = CallContext {
        identity: identity.to_string(),
        message_id: message_id.clone(),
        action: action.clone(),
        params: payload,
    };
    // The handler body may panic before it hands back a future.
    let guarded = AssertUnwindSafe(async move { handler(ctx).await });
    let outcome = match guarded.catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!("Handler for {} panicked", action);
            Err(RpcError::internal(format!("handler for '{action}' panicked")))
        }
    };

    match outcome {
        Ok(Reply::Suppressed) => None,
        Ok(Reply::Value(result)) => {
            if let Some(schemas) = schemas
                && let Err(violation) = schemas.validate_response(&action, &result)
            {
                tracing::warn!("Handler for {} produced an invalid reply: {}", action, violation);
                return Some(Frame::error(message_id, violation.into()));
            }
            Some(Frame::result(message_id, result))
        }
        Err(error) => {
            tracing::debug!("Handler for {} failed: {}", action, error);
            Some(Frame::error(message_id, error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocpp_rpc_core::{Direction, ErrorCode, JsonType, Shape};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn call(action: &str, payload: Value) -> Call {
        Call {
            message_id: "m1".to_string(),
            action: action.to_string(),
            payload,
        }
    }

    fn boot_schemas() -> SchemaSet {
        SchemaSet::new("ocpp2.0.1")
            .with(
                "BootNotification",
                Direction::Request,
                Shape::object()
                    .required("reason", JsonType::String)
                    .required("chargingStation", JsonType::Object),
            )
            .with(
                "BootNotification",
                Direction::Response,
                Shape::object()
                    .required("status", JsonType::String)
                    .required("interval", JsonType::Integer)
                    .required("currentTime", JsonType::String),
            )
    }

    fn boot_params() -> Value {
        json!({"reason": "PowerUp", "chargingStation": {"model": "L2", "vendorName": "Vega"}})
    }

    fn error_code(frame: Option<Frame>) -> ErrorCode {
        match frame {
            Some(Frame::CallError(e)) => e.error.code,
            other => panic!("expected CALLERROR, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_handler_is_not_implemented() {
        let table = HandlerTable::default();
        let reply = dispatch(&table, None, "CP1", call("BootNotification", boot_params())).await;
        assert_eq!(error_code(reply), ErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn handler_result_becomes_call_result() {
        let table = HandlerTable::default();
        table.insert("BootNotification", |ctx: CallContext| async move {
            assert_eq!(ctx.identity, "CP1");
            assert_eq!(ctx.params["reason"], "PowerUp");
            Ok::<_, RpcError>(json!({"status": "Accepted", "interval": 300, "currentTime": "t"}))
        });

        let reply = dispatch(
            &table,
            Some(&boot_schemas()),
            "CP1",
            call("BootNotification", boot_params()),
        )
        .await;
        let expected = json!({"status": "Accepted", "interval": 300, "currentTime": "t"});
        assert_eq!(reply, Some(Frame::result("m1", expected)));
    }

    #[tokio::test]
    async fn invalid_request_skips_handler() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let table = HandlerTable::default();
        let counter = invoked.clone();
        table.insert("BootNotification", move |_ctx: CallContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, RpcError>(json!({})) }
        });

        let reply = dispatch(
            &table,
            Some(&boot_schemas()),
            "CP1",
            call("BootNotification", json!({"reason": "PowerUp"})),
        )
        .await;
        assert_eq!(error_code(reply), ErrorCode::OccurrenceConstraintViolation);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_reply_is_reported_to_peer() {
        let table = HandlerTable::default();
        table.insert("BootNotification", |_ctx: CallContext| async {
            Ok::<_, RpcError>(json!({"status": "Accepted"}))
        });
        let reply = dispatch(
            &table,
            Some(&boot_schemas()),
            "CP1",
            call("BootNotification", boot_params()),
        )
        .await;
        assert_eq!(error_code(reply), ErrorCode::OccurrenceConstraintViolation);
    }

    #[tokio::test]
    async fn handler_error_and_panic_become_call_errors() {
        let table = HandlerTable::default();
        table.insert("Reset", |_ctx: CallContext| async {
            Err::<Value, _>(RpcError::not_supported("no resets today"))
        });
        table.insert("Explode", |_ctx: CallContext| async {
            if true {
                panic!("boom");
            }
            Ok::<Value, RpcError>(Value::Null)
        });

        let reply = dispatch(&table, None, "CP1", call("Reset", json!({}))).await;
        assert_eq!(error_code(reply), ErrorCode::NotSupported);

        let reply = dispatch(&table, None, "CP1", call("Explode", json!({}))).await;
        assert_eq!(error_code(reply), ErrorCode::InternalError);
    }

    #[tokio::test]
    async fn panic_before_handler_future_is_caught() {
        let table = Arc::new(HandlerTable::default());
        table.insert("GetLog", |ctx: CallContext| {
            let n = ctx.params["n"].as_u64().unwrap();
            async move { Ok::<_, RpcError>(json!({"n": n})) }
        });

        let shared = table.clone();
        let reply = tokio::spawn(async move {
            dispatch(&shared, None, "CP1", call("GetLog", json!({}))).await
        })
        .await
        .expect("dispatch task survives a panicking handler");
        assert_eq!(error_code(reply), ErrorCode::InternalError);

        let reply = dispatch(&table, None, "CP1", call("GetLog", json!({"n": 3}))).await;
        assert_eq!(reply, Some(Frame::result("m1", json!({"n": 3}))));
    }

    #[tokio::test]
    async fn suppressed_reply_sends_nothing() {
        let table = HandlerTable::default();
        table.insert("StatusNotification", |_ctx: CallContext| async {
            Ok::<_, RpcError>(Reply::Suppressed)
        });
        let reply = dispatch(&table, None, "CP1", call("StatusNotification", json!({}))).await;
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn last_registration_wins_and_fallback_applies() {
        let shared = Arc::new(HandlerTable::default());
        shared.insert("Heartbeat", |_ctx: CallContext| async {
            Ok::<_, RpcError>(json!({"from": "shared"}))
        });
        let table = HandlerTable::with_fallback(shared);

        let reply = dispatch(&table, None, "CP1", call("Heartbeat", json!({}))).await;
        assert_eq!(reply, Some(Frame::result("m1", json!({"from": "shared"}))));

        table.insert("Heartbeat", |_ctx: CallContext| async {
            Ok::<_, RpcError>(json!({"from": "first"}))
        });
        table.insert("Heartbeat", |_ctx: CallContext| async {
            Ok::<_, RpcError>(json!({"from": "own"}))
        });
        let reply = dispatch(&table, None, "CP1", call("Heartbeat", json!({}))).await;
        assert_eq!(reply, Some(Frame::result("m1", json!({"from": "own"}))));

        assert!(table.remove("Heartbeat"));
        let reply = dispatch(&table, None, "CP1", call("Heartbeat", json!({}))).await;
        assert_eq!(reply, Some(Frame::result("m1", json!({"from": "shared"}))));
    }
}
