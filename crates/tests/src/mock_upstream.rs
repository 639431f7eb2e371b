//! In-process mock origin server.
//!
//! Serves the probe endpoints tests proxy against:
//!
//! - `GET /hello` — constant body.
//! - `GET /time` — a strictly increasing counter, so cached responses are
//!   distinguishable from fresh ones.
//! - `GET /delay` — sleeps before answering.
//! - `GET /echo?msg=...` — echoes the query parameter.
//! - `GET /exceed` — a ~1.5 MB body, larger than the default cache ceiling.

use axum::{
    extract::{Query, State},
    routing::get,
    Router,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

#[derive(Default)]
struct MockState {
    counter: AtomicU64,
}

async fn hello() -> &'static str {
    "Hello, world!"
}

async fn time(State(state): State<Arc<MockState>>) -> String {
    let tick = state.counter.fetch_add(1, Ordering::SeqCst);
    format!("tick: {tick}")
}

async fn delay() -> &'static str {
    tokio::time::sleep(Duration::from_millis(200)).await;
    "delayed response"
}

async fn echo(Query(params): Query<HashMap<String, String>>) -> String {
    format!("Echo: {}", params.get("msg").cloned().unwrap_or_default())
}

async fn exceed() -> Vec<u8> {
    vec![b'a'; 1_500_000]
}

/// Builds the mock origin router.
pub fn router() -> Router {
    let state = Arc::new(MockState::default());
    Router::new()
        .route("/hello", get(hello))
        .route("/time", get(time))
        .route("/delay", get(delay))
        .route("/echo", get(echo))
        .route("/exceed", get(exceed))
        .with_state(state)
}

/// Binds the mock origin on a free local port and serves it in the
/// background. Returns the bound address and the server task handle.
pub async fn spawn() -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("mock upstream bind failed");
    let addr = listener.local_addr().expect("mock upstream local_addr failed");

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router()).await;
    });

    (addr, handle)
}
