//! Client endpoint: a charge point dialing its central system.

use crate::config::{CallOptions, RpcConfig};
use crate::dispatch::{CallContext, HandlerTable, Reply};
use crate::engine::{Ended, Engine};
use crate::error::{Error, Result};
use ocpp_rpc_core::{ConnectionState, PeerIdentity, RpcError, SchemaSet, StateChange};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};

/// How to reach the central system.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    endpoint: String,
    identity: PeerIdentity,
    config: RpcConfig,
    schemas: Option<SchemaSet>,
}

impl ClientOptions {
    /// `endpoint` is the base URL; the identity is appended as the last
    /// path segment.
    pub fn new(endpoint: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity: PeerIdentity::new(identity),
            config: RpcConfig::default(),
            schemas: None,
        }
    }

    /// Send `Authorization: Basic` with this password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.identity = self.identity.with_password(password);
        self
    }

    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Schemas used when `strict` is on.
    pub fn schemas(mut self, schemas: SchemaSet) -> Self {
        self.schemas = Some(schemas);
        self
    }
}

/// A client connection. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    engine: Arc<Engine>,
    endpoint: String,
    credentials: PeerIdentity,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Set by `close()`; suppresses reconnects until the next `connect()`.
    closed: AtomicBool,
}

impl RpcClient {
    pub fn new(options: ClientOptions) -> Self {
        let ClientOptions {
            endpoint,
            identity,
            config,
            schemas,
        } = options;
        let schemas = schemas.unwrap_or_else(|| SchemaSet::new(config.protocol.as_str()));
        let (events, _) = broadcast::channel(64);
        let engine = Engine::new(
            identity.id().to_string(),
            config,
            schemas,
            HandlerTable::default(),
            events,
        );
        Self {
            inner: Arc::new(ClientInner {
                engine,
                endpoint,
                credentials: identity,
                reconnect: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        self.inner.engine.identity()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.engine.state()
    }

    /// Lifecycle transitions from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.engine.subscribe()
    }

    /// Open the connection. A no-op when already open.
    ///
    /// A failed first attempt leaves the client `Disconnected` and is not
    /// retried; automatic reconnects only follow an established session.
    pub async fn connect(&self) -> Result<()> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.open().await
    }

    /// Close for good: cancels reconnects and fails pending calls.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        self.inner.engine.terminate();
        self.inner.engine.set_state(ConnectionState::Closed);
    }

    /// Register the handler for `action`, replacing any earlier one.
    pub fn handle<F, Fut, R>(&self, action: &str, handler: F)
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, RpcError>> + Send + 'static,
        R: Into<Reply>,
    {
        self.inner.engine.handlers.insert(action, handler);
    }

    pub fn remove_handler(&self, action: &str) -> bool {
        self.inner.engine.handlers.remove(action)
    }

    pub async fn call(&self, action: &str, params: Value) -> Result<Value> {
        self.call_with(action, params, CallOptions::default()).await
    }

    pub async fn call_with(
        &self,
        action: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value> {
        self.inner.engine.call(action, params, options).await
    }

    /// Write a text frame as-is, bypassing framing and validation.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<()> {
        self.inner.engine.send_raw(text.into())
    }

    /// Outbound calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.engine.pending_calls()
    }
}

impl ClientInner {
    fn request(&self) -> Result<Request> {
        let url = format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.credentials.id()
        );
        let mut request = url.as_str().into_client_request()?;

        let protocol = HeaderValue::from_str(&self.engine.config().protocol)
            .map_err(|e| Error::InvalidRequest(format!("subprotocol: {e}")))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

        if let Some(header) = self.credentials.authorization_header() {
            let value = HeaderValue::from_str(&header)
                .map_err(|e| Error::InvalidRequest(format!("authorization: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }

    async fn open(self: &Arc<Self>) -> Result<()> {
        if self.engine.state() == ConnectionState::Open {
            return Ok(());
        }
        let previous = self.engine.try_transition(
            "connect",
            &[ConnectionState::Disconnected, ConnectionState::Closed],
            ConnectionState::Connecting,
        )?;

        let attempt = match self.request() {
            Ok(request) => {
                tracing::debug!("Connecting {} to {}", self.credentials.id(), request.uri());
                tokio_tungstenite::connect_async(request)
                    .await
                    .map_err(Error::from)
            }
            Err(e) => Err(e),
        };

        let ws = match attempt {
            Ok((ws, _response)) => ws,
            Err(e) => {
                tracing::warn!("{} could not connect: {}", self.credentials.id(), e);
                // close() may have moved us on already.
                let _ = self.engine.try_transition(
                    "fail",
                    &[ConnectionState::Connecting],
                    previous,
                );
                return Err(e);
            }
        };

        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        self.cancel_reconnect();
        let (link, driver) = self.engine.attach(ws);
        self.engine.set_state(ConnectionState::Open);
        tracing::info!("{} connected to {}", self.credentials.id(), self.endpoint);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let ended = driver.await.unwrap_or(Ended::Failed);
            inner.on_transport_closed(link, ended);
        });
        Ok(())
    }

    fn on_transport_closed(self: &Arc<Self>, link: u64, ended: Ended) {
        let failed = self.engine.detach(link);
        if failed > 0 {
            tracing::debug!("{} pending calls failed on disconnect", failed);
        }
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        tracing::info!("{} lost its connection ({:?})", self.credentials.id(), ended);
        self.engine.set_state(ConnectionState::Closing);
        self.engine.set_state(ConnectionState::Closed);
        if self.engine.config().reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let delay = self.engine.config().reconnect_delay();
        let weak = Arc::downgrade(self);
        tracing::debug!("Reconnecting {} in {:?}", self.credentials.id(), delay);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // This task is finishing; forget its handle without aborting it.
            inner.take_reconnect();
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = inner.open().await {
                tracing::warn!("Reconnect of {} failed: {}", inner.credentials.id(), e);
                if !inner.closed.load(Ordering::SeqCst) {
                    inner.schedule_reconnect();
                }
            }
        });

        if let Some(previous) = self.reconnect_slot().replace(task) {
            previous.abort();
        }
    }

    fn reconnect_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reconnect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_reconnect(&self) -> Option<JoinHandle<()>> {
        self.reconnect_slot().take()
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.take_reconnect() {
            task.abort();
        }
    }
}
