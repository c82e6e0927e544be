//! Mock WebSocket venue for integration tests.
//!
//! Speaks the `JsonWireAdapter` protocol:
//! - Records every text frame it receives
//! - Acks subscribe/unsubscribe requests
//! - Answers `{"op":"ping"}` with a pong unless silenced
//! - Accepts `{"op":"auth"}` only for the configured token
//! - Pushes frames or closes every open connection on demand

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
enum ServerCommand {
    Send(String),
    /// Close with the given code; `None` sends a close frame without status.
    Close(Option<u16>),
}

#[derive(Clone)]
struct Shared {
    messages: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicU32>,
    silent: Arc<AtomicBool>,
    accepted_token: Arc<Option<String>>,
    commands: broadcast::Sender<ServerCommand>,
}

/// A mock WebSocket venue.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    shared: Shared,
}

impl MockWsServer {
    /// Start a public venue on an available port.
    pub async fn start() -> Self {
        Self::start_inner(None).await
    }

    /// Start a venue that authenticates `{"op":"auth"}` against `token`.
    pub async fn start_with_token(token: &str) -> Self {
        Self::start_inner(Some(token.to_string())).await
    }

    async fn start_inner(accepted_token: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands, _) = broadcast::channel(64);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let shared = Shared {
            messages: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicU32::new(0)),
            silent: Arc::new(AtomicBool::new(false)),
            accepted_token: Arc::new(accepted_token),
            commands,
        };

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(stream, accept_shared.clone()));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            shared,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> u32 {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub async fn received_messages(&self) -> Vec<String> {
        self.shared.messages.lock().await.clone()
    }

    /// Received frames whose `op` equals `op`, parsed.
    pub async fn received_ops(&self, op: &str) -> Vec<Value> {
        self.received_messages()
            .await
            .iter()
            .filter_map(|m| serde_json::from_str::<Value>(m).ok())
            .filter(|v| v.get("op").and_then(Value::as_str) == Some(op))
            .collect()
    }

    /// Poll until at least `count` frames with `op` were received.
    pub async fn wait_for_ops(&self, op: &str, count: usize) -> Vec<Value> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ops = self.received_ops(op).await;
                if ops.len() >= count {
                    return ops;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {count} {op} frames"))
    }

    /// Stop answering pings.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    /// Send a text frame to every open connection.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.shared.commands.send(ServerCommand::Send(text.into()));
    }

    /// Close every open connection.
    pub fn close_all(&self, code: Option<u16>) {
        let _ = self.shared.commands.send(ServerCommand::Close(code));
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(stream: TcpStream, shared: Shared) {
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let mut commands = shared.commands.subscribe();

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Ok(ServerCommand::Send(text)) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(ServerCommand::Close(code)) => {
                    let frame = code.map(|code| CloseFrame {
                        code: CloseCode::from(code),
                        reason: "mock close".into(),
                    });
                    let _ = write.send(Message::Close(frame)).await;
                    break;
                }
                Err(_) => break,
            },

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    shared.messages.lock().await.push(text.clone());
                    if let Some(reply) = reply_for(&text, &shared) {
                        if write.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if !shared.silent.load(Ordering::SeqCst) {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }
}

fn reply_for(text: &str, shared: &Shared) -> Option<String> {
    let parsed: Value = serde_json::from_str(text).ok()?;
    match parsed.get("op").and_then(Value::as_str)? {
        op @ ("subscribe" | "unsubscribe") => {
            let event = if op == "subscribe" {
                "subscribed"
            } else {
                "unsubscribed"
            };
            let mut reply = json!({ "event": event, "channel": parsed.get("channel") });
            if let Some(symbol) = parsed.get("symbol") {
                reply["symbol"] = symbol.clone();
            }
            Some(reply.to_string())
        }
        "ping" if !shared.silent.load(Ordering::SeqCst) => {
            Some(json!({ "event": "pong" }).to_string())
        }
        "auth" => {
            let token = parsed.get("token").and_then(Value::as_str);
            let success = shared.accepted_token.as_deref().is_some() && token == shared.accepted_token.as_deref();
            Some(json!({ "event": "auth", "success": success }).to_string())
        }
        _ => None,
    }
}
