//! Mock venue for application tests.
//!
//! One process-local venue with both faces the application talks to:
//! - WebSocket: acks `{"op":"subscribe"}` and follows each ack with a trade
//!   on the subscribed channel. Connections on a non-root path (listen-key
//!   streams) get an order update right after the handshake.
//! - REST: `POST`/`PUT /api/v3/userDataStream` create and extend a listen key.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};

pub const LISTEN_KEY: &str = "lk-1";
pub const LISTEN_KEY_PATH: &str = "/api/v3/userDataStream";

#[derive(Default)]
struct Shared {
    ws_paths: Mutex<Vec<String>>,
    ws_messages: Mutex<Vec<String>>,
    key_creates: AtomicU32,
    key_extends: Mutex<Vec<Value>>,
    reject_keys: AtomicBool,
}

pub struct MockVenue {
    ws_addr: SocketAddr,
    rest_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockVenue {
    pub async fn start() -> Self {
        let shared = Arc::new(Shared::default());

        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        let ws_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = ws_listener.accept().await {
                tokio::spawn(handle_connection(stream, ws_shared.clone()));
            }
        });

        let app = Router::new()
            .route(LISTEN_KEY_PATH, post(create_key).put(extend_key))
            .with_state(shared.clone());
        let rest_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rest_addr = rest_listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(rest_listener, app).await.unwrap();
        });

        Self {
            ws_addr,
            rest_addr,
            shared,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.ws_addr)
    }

    pub fn rest_url(&self) -> String {
        format!("http://{}", self.rest_addr)
    }

    /// Answer listen-key calls with 401 from now on.
    pub fn reject_keys(&self) {
        self.shared.reject_keys.store(true, Ordering::SeqCst);
    }

    pub fn ws_paths(&self) -> Vec<String> {
        self.shared.ws_paths.lock().unwrap().clone()
    }

    /// Received frames with the given `op`.
    pub fn received_ops(&self, op: &str) -> Vec<Value> {
        self.shared
            .ws_messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| serde_json::from_str::<Value>(m).ok())
            .filter(|v| v.get("op").and_then(Value::as_str) == Some(op))
            .collect()
    }

    pub fn key_creates(&self) -> u32 {
        self.shared.key_creates.load(Ordering::SeqCst)
    }

    pub fn key_extends(&self) -> Vec<Value> {
        self.shared.key_extends.lock().unwrap().clone()
    }
}

async fn create_key(State(shared): State<Arc<Shared>>) -> (StatusCode, Json<Value>) {
    if shared.reject_keys.load(Ordering::SeqCst) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad api key"})));
    }
    shared.key_creates.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, Json(json!({ "listenKey": LISTEN_KEY })))
}

async fn extend_key(
    State(shared): State<Arc<Shared>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if shared.reject_keys.load(Ordering::SeqCst) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad api key"})));
    }
    shared.key_extends.lock().unwrap().push(body);
    (StatusCode::OK, Json(json!({})))
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let path_shared = shared.clone();
    let callback = move |request: &Request, response: Response| {
        path_shared
            .ws_paths
            .lock()
            .unwrap()
            .push(request.uri().path().to_string());
        Ok(response)
    };
    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let private = shared
        .ws_paths
        .lock()
        .unwrap()
        .last()
        .is_some_and(|p| p != "/");

    let (mut write, mut read) = ws_stream.split();

    if private {
        let order = json!({
            "channel": "orders",
            "type": "order",
            "data": {
                "order_id": "1001",
                "status": "filled",
                "side": "buy",
                "price": "50000",
                "size": "0.01",
                "filled_size": "0.01"
            }
        });
        let _ = write.send(Message::Text(order.to_string())).await;
    }

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                shared.ws_messages.lock().unwrap().push(text.clone());
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                match parsed.get("op").and_then(Value::as_str) {
                    Some("subscribe") => {
                        let ack = json!({
                            "event": "subscribed",
                            "channel": parsed["channel"],
                            "symbol": parsed["symbol"],
                        });
                        let trade = json!({
                            "channel": parsed["channel"],
                            "symbol": parsed["symbol"],
                            "type": "trade",
                            "data": {
                                "trade_id": "1",
                                "price": "50000",
                                "size": "0.5",
                                "side": "sell",
                                "timestamp_ms": 1700000000000u64
                            }
                        });
                        let _ = write.send(Message::Text(ack.to_string())).await;
                        let _ = write.send(Message::Text(trade.to_string())).await;
                    }
                    Some("ping") => {
                        let _ = write
                            .send(Message::Text(json!({"event": "pong"}).to_string()))
                            .await;
                    }
                    _ => {}
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }
}
