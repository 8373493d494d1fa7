//! Server endpoint: accepts charge point connections.

use crate::config::{CallOptions, RpcConfig};
use crate::dispatch::{CallContext, HandlerTable, Reply};
use crate::engine::{Ended, Engine, Transport};
use crate::error::{Error, Result};
use crate::registry::PeerRegistry;
use ocpp_rpc_core::{ConnectionState, IdentityError, PeerIdentity, RpcError, SchemaSet, StateChange};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};

/// A central system. Cheap to clone; clones share peers and handlers.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: RpcConfig,
    schemas: SchemaSet,
    handlers: Arc<HandlerTable>,
    peers: PeerRegistry<ServerConnection>,
    events: broadcast::Sender<StateChange>,
}

impl RpcServer {
    pub fn new(config: RpcConfig) -> Self {
        let schemas = SchemaSet::new(config.protocol.as_str());
        Self::with_schemas(config, schemas)
    }

    /// A server validating against `schemas` when `strict` is on.
    pub fn with_schemas(config: RpcConfig, schemas: SchemaSet) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ServerInner {
                config,
                schemas,
                handlers: Arc::new(HandlerTable::default()),
                peers: PeerRegistry::default(),
                events,
            }),
        }
    }

    /// Register a handler for every connection. A connection's own handler
    /// for the same action takes precedence.
    pub fn handle<F, Fut, R>(&self, action: &str, handler: F)
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, RpcError>> + Send + 'static,
        R: Into<Reply>,
    {
        self.inner.handlers.insert(action, handler);
    }

    pub fn remove_handler(&self, action: &str) -> bool {
        self.inner.handlers.remove(action)
    }

    /// Lifecycle transitions of every connection.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events.subscribe()
    }

    /// The live connection for `identity`.
    pub fn peer(&self, identity: &str) -> Option<ServerConnection> {
        self.inner.peers.get(identity)
    }

    /// Identities with a live connection, sorted.
    pub fn peers(&self) -> Vec<String> {
        self.inner.peers.identities()
    }

    /// Call `action` on the peer connected as `identity`.
    pub async fn call(&self, identity: &str, action: &str, params: Value) -> Result<Value> {
        self.call_with(identity, action, params, CallOptions::default()).await
    }

    pub async fn call_with(
        &self,
        identity: &str,
        action: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value> {
        let peer = self.peer(identity).ok_or(Error::NotConnected)?;
        peer.call_with(action, params, options).await
    }

    /// Bind `addr` and serve until the listener fails.
    pub async fn listen(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on ws://{}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.accept(stream).await {
                    tracing::warn!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }

    /// Run the WebSocket handshake on `stream` and attach the connection.
    pub async fn accept<S>(&self, stream: S) -> Result<ServerConnection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let protocol = self.inner.config.protocol.as_str();
        let mut resolved = None;

        let callback = |request: &Request,
                        mut response: Response|
         -> std::result::Result<Response, ErrorResponse> {
            let authorization = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok());
            let identity = PeerIdentity::resolve(request.uri().path(), authorization)
                .map_err(|e| reject(StatusCode::UNAUTHORIZED, e.to_string()))?;

            let offered = offered_protocols(request);
            if offered.iter().any(|p| p == protocol) {
                let value = HeaderValue::from_str(protocol)
                    .map_err(|e| reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
                response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            } else if !offered.is_empty() {
                return Err(reject(
                    StatusCode::BAD_REQUEST,
                    format!("unsupported subprotocol {}, expected {protocol}", offered.join(", ")),
                ));
            }

            resolved = Some(identity);
            Ok(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

        let identity = resolved.ok_or(Error::Identity(IdentityError::Missing))?;
        Ok(self.attach(identity.id(), ws))
    }

    /// Attach an already-upgraded transport as `identity`. The connection is
    /// open immediately; a previous connection under the same identity is
    /// closed.
    pub fn attach<T: Transport>(&self, identity: &str, transport: T) -> ServerConnection {
        let engine = Engine::new(
            identity.to_string(),
            self.inner.config.clone(),
            self.inner.schemas.clone(),
            HandlerTable::with_fallback(Arc::clone(&self.inner.handlers)),
            self.inner.events.clone(),
        );
        let (link, driver) = engine.attach(transport);
        engine.set_state(ConnectionState::Open);
        let connection = ServerConnection { engine };

        if let Some(previous) = self.inner.peers.insert(identity, connection.clone()) {
            tracing::info!("{} reconnected, closing its previous connection", identity);
            previous.close();
        } else {
            tracing::info!("{} connected", identity);
        }

        let inner = Arc::clone(&self.inner);
        let retired = connection.clone();
        tokio::spawn(async move {
            let ended = driver.await.unwrap_or(Ended::Failed);
            let engine = &retired.engine;
            engine.detach(link);
            inner
                .peers
                .remove_if(engine.identity(), |peer| *peer == retired);

            match ended {
                Ended::Stale => tracing::warn!("Evicted unresponsive peer {}", engine.identity()),
                _ => tracing::info!("{} disconnected", engine.identity()),
            }
            if engine
                .try_transition("close", &[ConnectionState::Open], ConnectionState::Closing)
                .is_ok()
            {
                engine.set_state(ConnectionState::Closed);
            }
        });

        connection
    }
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

fn offered_protocols(request: &Request) -> Vec<String> {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// One accepted peer.
#[derive(Clone)]
pub struct ServerConnection {
    engine: Arc<Engine>,
}

impl ServerConnection {
    pub fn identity(&self) -> &str {
        self.engine.identity()
    }

    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    /// False between a ping and its pong.
    pub fn is_alive(&self) -> bool {
        self.engine.is_alive()
    }

    pub fn last_pong_at(&self) -> Option<SystemTime> {
        self.engine.last_pong_at()
    }

    /// Register a handler for this connection only.
    pub fn handle<F, Fut, R>(&self, action: &str, handler: F)
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, RpcError>> + Send + 'static,
        R: Into<Reply>,
    {
        self.engine.handlers.insert(action, handler);
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
        self.engine.call(action, params, options).await
    }

    pub fn send_raw(&self, text: impl Into<String>) -> Result<()> {
        self.engine.send_raw(text.into())
    }

    pub fn pending_calls(&self) -> usize {
        self.engine.pending_calls()
    }

    /// Terminate the transport. Pending calls fail with `Disconnected`.
    pub fn close(&self) {
        self.engine.terminate();
        self.engine.set_state(ConnectionState::Closed);
    }
}

impl PartialEq for ServerConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("identity", &self.identity())
            .field("state", &self.state())
            .finish()
    }
}
