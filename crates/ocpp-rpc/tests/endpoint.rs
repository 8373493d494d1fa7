//! Client and server talking over real localhost sockets.

use futures_util::{SinkExt, StreamExt};
use ocpp_rpc::{
    CallContext, CallOptions, ClientOptions, ConnectionState, Direction, Error, ErrorCode,
    JsonType, Reply, RpcClient, RpcConfig, RpcError, RpcServer, SchemaSet, Shape,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;

fn config() -> RpcConfig {
    RpcConfig {
        call_timeout_ms: 2_000,
        ping_interval_ms: 0,
        reconnect_delay_ms: 50,
        ..RpcConfig::default()
    }
}

async fn start(server: &RpcServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = server.clone();
    tokio::spawn(async move { server.serve(listener).await });
    addr
}

fn client(addr: SocketAddr, identity: &str) -> RpcClient {
    RpcClient::new(ClientOptions::new(format!("ws://{addr}/ocpp"), identity).config(config()))
}

fn boot_request() -> Value {
    json!({"reason": "PowerUp", "chargingStation": {"model": "L2", "vendorName": "Vega"}})
}

async fn wait_for_peer(server: &RpcServer, identity: &str) {
    for _ in 0..100 {
        if server.peer(identity).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{identity} never registered");
}

#[tokio::test]
async fn boot_without_handler_is_not_implemented() {
    let server = RpcServer::new(config());
    let addr = start(&server).await;
    let station = client(addr, "CP1");
    station.connect().await.unwrap();

    match station.call("BootNotification", boot_request()).await {
        Err(Error::Remote(e)) => assert_eq!(e.code, ErrorCode::NotImplemented),
        other => panic!("expected NotImplemented, got {other:?}"),
    }
    assert_eq!(station.state(), ConnectionState::Open);
}

#[tokio::test]
async fn boot_handler_result_reaches_caller_unchanged() {
    let server = RpcServer::new(config());
    server.handle("BootNotification", |ctx: CallContext| async move {
        assert_eq!(ctx.identity, "CP1");
        Ok::<_, RpcError>(json!({
            "status": "Accepted",
            "interval": 300,
            "currentTime": "2025-01-01T00:00:00.000Z"
        }))
    });
    let addr = start(&server).await;
    let station = client(addr, "CP1");
    station.connect().await.unwrap();

    let reply = station.call("BootNotification", boot_request()).await.unwrap();
    assert_eq!(
        reply,
        json!({"status": "Accepted", "interval": 300, "currentTime": "2025-01-01T00:00:00.000Z"})
    );
    assert_eq!(server.peers(), vec!["CP1"]);
}

#[tokio::test]
async fn malformed_frame_leaves_connection_usable() {
    let server = RpcServer::new(config());
    server.handle("Heartbeat", |_ctx: CallContext| async {
        Ok::<_, RpcError>(json!({"currentTime": "2025-01-01T00:00:00Z"}))
    });
    let addr = start(&server).await;

    let mut request = format!("ws://{addr}/ocpp/RAW1").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "ocpp2.0.1".parse().unwrap());
    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.headers()["Sec-WebSocket-Protocol"], "ocpp2.0.1");

    ws.send(Message::Text(r#"["not-an-array"]"#.into())).await.unwrap();
    ws.send(Message::Text(r#"[2,"hb-1","Heartbeat",{}]"#.into())).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply, json!([3, "hb-1", {"currentTime": "2025-01-01T00:00:00Z"}]));
}

#[tokio::test]
async fn server_calls_the_station() {
    let server = RpcServer::new(config());
    let addr = start(&server).await;
    let station = client(addr, "CP7");
    station.handle("GetVariables", |ctx: CallContext| async move {
        let count = ctx.params["getVariableData"].as_array().map_or(0, Vec::len);
        Ok::<_, RpcError>(json!({"count": count}))
    });
    station.connect().await.unwrap();
    wait_for_peer(&server, "CP7").await;

    let reply = server
        .call("CP7", "GetVariables", json!({"getVariableData": [{}, {}]}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"count": 2}));

    assert!(matches!(
        server.call("CP404", "GetVariables", json!({})).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn slow_handler_times_out_and_late_reply_is_ignored() {
    let server = RpcServer::new(config());
    server.handle("DataTransfer", |_ctx: CallContext| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok::<_, RpcError>(json!({"status": "Accepted"}))
    });
    let addr = start(&server).await;
    let station = client(addr, "CP1");
    station.connect().await.unwrap();

    let outcome = station
        .call_with(
            "DataTransfer",
            json!({"vendorId": "acme"}),
            CallOptions::timeout(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(outcome, Err(Error::Timeout { .. })));

    // The late reply arrives and is dropped; the connection keeps working.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(station.pending_calls(), 0);
    let reply = station.call("DataTransfer", json!({"vendorId": "acme"})).await.unwrap();
    assert_eq!(reply, json!({"status": "Accepted"}));
}

#[tokio::test]
async fn suppressed_reply_pairs_with_no_reply_call() {
    let server = RpcServer::new(config());
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    server.handle("StatusNotification", move |ctx: CallContext| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(ctx.params);
            Ok::<_, RpcError>(Reply::Suppressed)
        }
    });
    let addr = start(&server).await;
    let station = client(addr, "CP1");
    station.connect().await.unwrap();

    let params = json!({"connectorStatus": "Available", "evseId": 1, "connectorId": 1});
    let reply = station
        .call_with("StatusNotification", params.clone(), CallOptions::no_reply())
        .await
        .unwrap();
    assert_eq!(reply, Value::Null);
    assert_eq!(station.pending_calls(), 0);

    let seen = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv()).await.unwrap();
    assert_eq!(seen, Some(params));
}

#[tokio::test]
async fn strict_mode_rejects_invalid_payloads_both_ways() {
    let schemas = SchemaSet::new("ocpp2.0.1")
        .with(
            "Heartbeat",
            Direction::Request,
            Shape::object().closed(),
        )
        .with(
            "Heartbeat",
            Direction::Response,
            Shape::object().required("currentTime", JsonType::String),
        );
    let strict = RpcConfig {
        strict: true,
        ..config()
    };

    let server = RpcServer::with_schemas(strict.clone(), schemas.clone());
    server.handle("Heartbeat", |_ctx: CallContext| async {
        Ok::<_, RpcError>(json!({"currentTime": "2025-01-01T00:00:00Z"}))
    });
    let addr = start(&server).await;
    let station = RpcClient::new(
        ClientOptions::new(format!("ws://{addr}/ocpp"), "CP1")
            .config(strict)
            .schemas(schemas),
    );
    station.connect().await.unwrap();

    // Caught locally, nothing is sent.
    assert!(matches!(
        station.call("Heartbeat", json!({"unexpected": true})).await,
        Err(Error::Validation(_))
    ));
    // No schema for the action at all.
    assert!(matches!(
        station.call("Authorize", json!({})).await,
        Err(Error::Validation(_))
    ));

    let reply = station.call("Heartbeat", json!({})).await.unwrap();
    assert_eq!(reply["currentTime"], "2025-01-01T00:00:00Z");
}

#[tokio::test]
async fn authorization_header_names_the_peer() {
    let server = RpcServer::new(config());
    server.handle("Heartbeat", |ctx: CallContext| async move {
        Ok::<_, RpcError>(json!({"identity": ctx.identity}))
    });
    let addr = start(&server).await;
    let station = RpcClient::new(
        ClientOptions::new(format!("ws://{addr}/ocpp"), "CP-AUTH")
            .password("s3cret")
            .config(config()),
    );
    station.connect().await.unwrap();

    let reply = station.call("Heartbeat", json!({})).await.unwrap();
    assert_eq!(reply, json!({"identity": "CP-AUTH"}));
}

#[tokio::test]
async fn foreign_subprotocol_is_refused() {
    let server = RpcServer::new(config());
    let addr = start(&server).await;
    let station = RpcClient::new(
        ClientOptions::new(format!("ws://{addr}/ocpp"), "CP1").config(RpcConfig {
            protocol: "ocpp1.6".to_string(),
            ..config()
        }),
    );
    assert!(station.connect().await.is_err());
    assert_eq!(station.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn dropped_connection_fails_pending_calls_and_reconnects() {
    let server = RpcServer::new(config());
    let addr = start(&server).await;
    let station = client(addr, "CP1");
    let mut events = station.subscribe();
    station.connect().await.unwrap();
    wait_for_peer(&server, "CP1").await;

    // Nobody on the server answers this one.
    let (arrived_tx, arrived_rx) = tokio::sync::oneshot::channel::<()>();
    let arrived_tx = std::sync::Mutex::new(Some(arrived_tx));
    server.handle("GetLog", move |_ctx: CallContext| {
        if let Some(tx) = arrived_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        async {
            std::future::pending::<()>().await;
            Ok::<_, RpcError>(Value::Null)
        }
    });

    let caller = station.clone();
    let pending = tokio::spawn(async move {
        caller
            .call_with(
                "GetLog",
                json!({}),
                CallOptions::timeout(Duration::from_secs(10)),
            )
            .await
    });
    arrived_rx.await.unwrap();

    let first = server.peer("CP1").unwrap();
    first.close();
    assert!(matches!(pending.await.unwrap(), Err(Error::Disconnected)));

    let mut seen = Vec::new();
    let reopened = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let change = events.recv().await.unwrap();
            seen.push(change.state);
            if seen.ends_with(&[ConnectionState::Connecting, ConnectionState::Open])
                && seen.contains(&ConnectionState::Closed)
            {
                break;
            }
        }
    })
    .await;
    assert!(reopened.is_ok(), "no reconnect, saw {seen:?}");
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Connecting,
            ConnectionState::Open,
        ]
    );

    wait_for_peer(&server, "CP1").await;
    server.handle("Heartbeat", |_ctx: CallContext| async {
        Ok::<_, RpcError>(json!({"currentTime": "2025-01-01T00:00:00Z"}))
    });
    station.call("Heartbeat", json!({})).await.unwrap();
}

/// Completes the upgrade, then never reads again, so pings go unanswered.
async fn start_unresponsive() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            let callback = |_request: &Request,
                            mut response: Response|
             -> Result<Response, ErrorResponse> {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("ocpp2.0.1"));
                Ok(response)
            };
            if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                held.push(ws);
            }
        }
    });
    addr
}

#[tokio::test]
async fn unresponsive_server_is_dropped_and_redialed() {
    let addr = start_unresponsive().await;
    let station = RpcClient::new(
        ClientOptions::new(format!("ws://{addr}/ocpp"), "CP1").config(RpcConfig {
            ping_interval_ms: 50,
            ..config()
        }),
    );
    let mut events = station.subscribe();
    station.connect().await.unwrap();

    let caller = station.clone();
    let pending = tokio::spawn(async move {
        caller
            .call_with(
                "Heartbeat",
                json!({}),
                CallOptions::timeout(Duration::from_secs(10)),
            )
            .await
    });
    let outcome = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("stale connection was never dropped");
    assert!(matches!(outcome.unwrap(), Err(Error::Disconnected)));

    let mut seen = Vec::new();
    let redialed = tokio::time::timeout(Duration::from_secs(2), async {
        while seen.len() < 5 {
            seen.push(events.recv().await.unwrap().state);
        }
    })
    .await;
    assert!(redialed.is_ok(), "no redial, saw {seen:?}");
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Connecting,
        ]
    );
    station.close();
}

#[tokio::test]
async fn explicit_close_stops_reconnecting() {
    let server = RpcServer::new(config());
    let addr = start(&server).await;
    let station = client(addr, "CP1");
    station.connect().await.unwrap();
    wait_for_peer(&server, "CP1").await;

    station.close();
    assert_eq!(station.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(station.state(), ConnectionState::Closed);
    assert!(server.peer("CP1").is_none());
}
