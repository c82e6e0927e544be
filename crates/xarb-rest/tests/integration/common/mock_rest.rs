//! Mock REST venue for integration tests.
//!
//! Every route answers from a script of canned responses, one per call,
//! repeating the last entry once the script runs out. Each request is
//! recorded with its query, body and idempotency header.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::routing::any;
use axum::Router;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// One canned response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<u64>,
    /// Delay before answering.
    pub delay: Duration,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: if status < 300 {
                r#"{"ok":true}"#.to_string()
            } else {
                r#"{"error":"scripted"}"#.to_string()
            },
            retry_after: None,
            delay: Duration::ZERO,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A request as the venue saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub query: Option<String>,
    pub body: String,
    pub idempotency_key: Option<String>,
}

#[derive(Default)]
struct VenueState {
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    requests: Mutex<Vec<Recorded>>,
}

pub struct MockRestServer {
    addr: SocketAddr,
    state: Arc<VenueState>,
}

impl MockRestServer {
    pub async fn start(script: Vec<Reply>) -> Self {
        let state = Arc::new(VenueState {
            script: Mutex::new(script.into()),
            ..Default::default()
        });
        let app = Router::new()
            .route("/{*path}", any(scripted))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }
}

async fn scripted(
    State(state): State<Arc<VenueState>>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, HeaderMap, String) {
    state.requests.lock().unwrap().push(Recorded {
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        body,
        idempotency_key: headers
            .get("x-idempotency-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    let reply = {
        let next = state.script.lock().unwrap().pop_front();
        let mut last = state.last.lock().unwrap();
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone().unwrap_or_else(|| Reply::status(200))
    };

    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    let mut response_headers = HeaderMap::new();
    if let Some(secs) = reply.retry_after {
        response_headers.insert("retry-after", HeaderValue::from(secs));
    }
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, response_headers, reply.body)
}
