//! Connection engine shared by client and server endpoints.
//!
//! One driver task per connection owns the transport. It reads frames
//! strictly in order, writes whatever the rest of the endpoint queues on the
//! outbound channel and runs the liveness probe. Inbound calls are handed to
//! their own tasks so a slow handler only delays its own reply.

use crate::config::{CallOptions, RpcConfig};
use crate::dispatch::{self, HandlerTable};
use crate::error::{Error, Result};
use crate::liveness::{Liveness, Probe};
use crate::pending::PendingCalls;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use ocpp_rpc_core::{ConnectionState, Frame, SchemaSet, StateChange};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};

/// How long a graceful close may take before the transport is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Any WebSocket-shaped message stream, such as `WebSocketStream<S>`.
pub trait Transport:
    Stream<Item = std::result::Result<Message, tungstenite::Error>>
    + Sink<Message, Error = tungstenite::Error>
    + Unpin
    + Send
    + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = std::result::Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin
        + Send
        + 'static
{
}

enum Outbound {
    Text(String),
    Terminate,
}

#[derive(Clone)]
struct Link {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Link {
    fn send(&self, text: String) -> Result<()> {
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| Error::NotConnected)
    }
}

/// Why a driver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ended {
    /// The peer closed the connection.
    Closed,
    /// We asked for it.
    Terminated,
    /// The peer stopped answering pings.
    Stale,
    /// Transport error.
    Failed,
}

pub(crate) struct Engine {
    identity: String,
    config: RpcConfig,
    schemas: SchemaSet,
    pub(crate) handlers: HandlerTable,
    pending: PendingCalls,
    link: Mutex<Option<Link>>,
    next_link: AtomicU64,
    liveness: Mutex<Liveness>,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<StateChange>,
    call_slots: Semaphore,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Engine {
    pub(crate) fn new(
        identity: String,
        config: RpcConfig,
        schemas: SchemaSet,
        handlers: HandlerTable,
        events: broadcast::Sender<StateChange>,
    ) -> Arc<Self> {
        let call_slots = Semaphore::new(config.call_concurrency.max(1));
        Arc::new(Self {
            identity,
            config,
            schemas,
            handlers,
            pending: PendingCalls::default(),
            link: Mutex::new(None),
            next_link: AtomicU64::new(1),
            liveness: Mutex::new(Liveness::default()),
            state: Mutex::new(ConnectionState::Disconnected),
            events,
            call_slots,
        })
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        {
            let mut current = lock(&self.state);
            if *current == state {
                return;
            }
            *current = state;
        }
        self.publish(state);
    }

    /// Move to `to` only from one of `from`; returns the previous state.
    pub(crate) fn try_transition(
        &self,
        op: &'static str,
        from: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<ConnectionState> {
        let previous = {
            let mut current = lock(&self.state);
            let previous = *current;
            if !from.contains(&previous) {
                return Err(Error::InvalidState {
                    op,
                    state: previous,
                });
            }
            *current = to;
            previous
        };
        if previous != to {
            self.publish(to);
        }
        Ok(previous)
    }

    fn publish(&self, state: ConnectionState) {
        tracing::debug!("{} is now {}", self.identity, state);
        // No subscribers is fine.
        let _ = self.events.send(StateChange {
            identity: self.identity.clone(),
            state,
            at: SystemTime::now(),
        });
    }

    /// Schemas to check against, or `None` when validation is off.
    fn validator(&self) -> Option<&SchemaSet> {
        self.config.strict.then_some(&self.schemas)
    }

    fn liveness(&self) -> MutexGuard<'_, Liveness> {
        lock(&self.liveness)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.liveness().is_alive()
    }

    pub(crate) fn last_pong_at(&self) -> Option<SystemTime> {
        self.liveness().last_pong_at()
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn current_link(&self) -> Result<Link> {
        lock(&self.link).clone().ok_or(Error::NotConnected)
    }

    /// Queue a raw text frame on the live connection.
    pub(crate) fn send_raw(&self, text: String) -> Result<()> {
        self.current_link()?.send(text)
    }

    /// Ask the driver to close the transport.
    pub(crate) fn terminate(&self) {
        if let Some(link) = lock(&self.link).as_ref() {
            let _ = link.tx.send(Outbound::Terminate);
        }
    }

    /// Issue an outbound call and wait for its reply.
    pub(crate) async fn call(
        &self,
        action: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value> {
        if let Some(schemas) = self.validator() {
            schemas.validate_request(action, &params)?;
        }

        let _permit = self.call_slots.acquire().await.map_err(|_| Error::Closed)?;
        let link = self.current_link()?;
        let message_id = uuid::Uuid::new_v4().to_string();
        let text = Frame::call(message_id.as_str(), action, params).encode();

        if options.no_reply {
            link.send(text)?;
            return Ok(Value::Null);
        }

        let deadline =
            Instant::now() + options.timeout.unwrap_or_else(|| self.config.call_timeout());
        let mut rx = self.pending.register(&message_id, action, deadline)?;
        if let Err(e) = link.send(text) {
            self.pending.discard(&message_id);
            return Err(e);
        }
        tracing::debug!("{} -> {} {}", self.identity, action, message_id);

        let outcome = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(received) => received,
            Err(_) => {
                // Settles this call unless a reply got there first.
                self.pending.sweep_expired(Instant::now());
                rx.await
            }
        };
        outcome.unwrap_or(Err(Error::Disconnected))
    }

    /// Start a driver for a freshly opened transport.
    pub(crate) fn attach<T: Transport>(self: &Arc<Self>, transport: T) -> (u64, JoinHandle<Ended>) {
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Link { id, tx };
        *lock(&self.link) = Some(link.clone());
        *self.liveness() = Liveness::default();

        let engine = Arc::clone(self);
        (id, tokio::spawn(drive(engine, link, transport, rx)))
    }

    /// Forget a finished connection and fail its pending calls.
    pub(crate) fn detach(&self, link_id: u64) -> usize {
        {
            let mut link = lock(&self.link);
            if link.as_ref().is_none_or(|l| l.id != link_id) {
                return 0;
            }
            *link = None;
        }
        self.pending.reject_all()
    }

    fn on_text(self: &Arc<Self>, link: &Link, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    "Dropping malformed frame from {} ({}): {}",
                    self.identity,
                    e.code(),
                    e
                );
                return;
            }
        };

        match frame {
            Frame::Call(call) => {
                let engine = Arc::clone(self);
                let link = link.clone();
                tokio::spawn(async move {
                    let reply = dispatch::dispatch(
                        &engine.handlers,
                        engine.validator(),
                        &engine.identity,
                        call,
                    )
                    .await;
                    if let Some(reply) = reply
                        && link.send(reply.encode()).is_err()
                    {
                        tracing::debug!(
                            "Connection to {} went away before reply {} was sent",
                            engine.identity,
                            reply.message_id()
                        );
                    }
                });
            }
            Frame::CallResult(result) => {
                if !self
                    .pending
                    .resolve(&result.message_id, result.payload, self.validator())
                {
                    tracing::warn!(
                        "{} sent a result for unknown call {}",
                        self.identity,
                        result.message_id
                    );
                }
            }
            Frame::CallError(error) => {
                if !self.pending.reject(&error.message_id, error.error) {
                    tracing::warn!(
                        "{} sent an error for unknown call {}",
                        self.identity,
                        error.message_id
                    );
                }
            }
        }
    }
}

async fn drive<T: Transport>(
    engine: Arc<Engine>,
    link: Link,
    transport: T,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> Ended {
    let (mut sink, mut stream) = transport.split();

    let period = engine.config.ping_interval();
    // The probe branch is disabled without a period; the value is unused.
    let every = period.unwrap_or(Duration::from_secs(3600));
    let mut probe = tokio::time::interval_at(Instant::now() + every, every);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => engine.on_text(&link, text.as_str()),
                    Some(Ok(Message::Pong(_))) => {
                        engine.liveness().on_pong(SystemTime::now());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::warn!("Ignoring binary frame from {}", engine.identity);
                    }
                    Some(Ok(Message::Close(_))) | None => return Ended::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error from {}: {}", engine.identity, e);
                        return Ended::Failed;
                    }
                }
            }

            out = rx.recv() => {
                match out {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            tracing::debug!("Send to {} failed: {}", engine.identity, e);
                            return Ended::Failed;
                        }
                    }
                    Some(Outbound::Terminate) | None => {
                        let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
                        return Ended::Terminated;
                    }
                }
            }

            _ = probe.tick(), if period.is_some() => {
                engine.pending.sweep_expired(Instant::now());
                let verdict = engine.liveness().sweep();
                match verdict {
                    Probe::Ping => {
                        if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                            tracing::debug!("Ping to {} failed: {}", engine.identity, e);
                            return Ended::Failed;
                        }
                    }
                    Probe::Stale => {
                        tracing::warn!("{} missed two liveness probes", engine.identity);
                        return Ended::Stale;
                    }
                }
            }
        }
    }
}
