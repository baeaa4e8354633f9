//! Helpers for testing the pinning service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test.
//!
//!  - When using [`IpfsDaemon`], make sure that the daemon is held until all requests to it have
//!    been made. Dropping it aborts the server task and all connections to it will fail.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::json;
use tokio::sync::broadcast;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `pinion_service` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("pinion_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a router.
///
/// The server is stopped when dropped.
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Creates a new test server from the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns the base URL of this server.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self) -> String {
        format!("http://localhost:{}/", self.port())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Params = Query<HashMap<String, String>>;

struct DaemonState {
    peer_id: String,
    hits: Mutex<BTreeMap<String, usize>>,
    pinned: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Bytes)>>,
    peers: Mutex<Vec<String>>,
    fail_pins: AtomicBool,
    messages: broadcast::Sender<String>,
}

impl DaemonState {
    fn hit(&self, path: &str) {
        let mut hits = self.hits.lock().unwrap();
        *hits.entry(path.to_owned()).or_default() += 1;
    }
}

fn arg(params: &Params) -> String {
    params.get("arg").cloned().unwrap_or_default()
}

/// Encodes bytes the way the daemon does in its pubsub API.
pub fn multibase(data: &[u8]) -> String {
    format!("u{}", URL_SAFE_NO_PAD.encode(data))
}

async fn id(State(state): State<Arc<DaemonState>>) -> Json<serde_json::Value> {
    state.hit("id");
    Json(json!({ "ID": state.peer_id, "AgentVersion": "pinion-test" }))
}

async fn pin_add(State(state): State<Arc<DaemonState>>, params: Params) -> Response {
    state.hit("pin/add");
    let hash = arg(&params);
    if state.fail_pins.load(Ordering::SeqCst) {
        let body = json!({ "Message": format!("failed to pin {hash}"), "Code": 0, "Type": "error" });
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
    }
    state.pinned.lock().unwrap().push(hash.clone());
    Json(json!({ "Pins": [hash] })).into_response()
}

async fn pubsub_pub(State(state): State<Arc<DaemonState>>, params: Params, body: Bytes) {
    state.hit("pubsub/pub");
    state.published.lock().unwrap().push((arg(&params), body));
}

async fn pubsub_peers(State(state): State<Arc<DaemonState>>) -> Json<serde_json::Value> {
    state.hit("pubsub/peers");
    let peers = state.peers.lock().unwrap().clone();
    Json(json!({ "Strings": peers }))
}

async fn pubsub_sub(State(state): State<Arc<DaemonState>>) -> Body {
    state.hit("pubsub/sub");
    let receiver = state.messages.subscribe();
    let lines = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(line) => return Some((Ok::<_, Infallible>(line), receiver)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Body::from_stream(lines)
}

/// A fake IPFS daemon exposing the subset of the HTTP RPC API the service talks to.
///
/// All requests are counted per endpoint, pins and publications are recorded, and pubsub
/// messages can be injected into open subscriptions with [`send_message`](Self::send_message).
pub struct IpfsDaemon {
    server: Server,
    state: Arc<DaemonState>,
}

impl IpfsDaemon {
    /// Starts a new fake daemon answering `id` requests with the given peer id.
    pub fn new(peer_id: &str) -> Self {
        let (messages, _) = broadcast::channel(64);
        let state = Arc::new(DaemonState {
            peer_id: peer_id.to_owned(),
            hits: Default::default(),
            pinned: Default::default(),
            published: Default::default(),
            peers: Default::default(),
            fail_pins: AtomicBool::new(false),
            messages,
        });

        let router = Router::new()
            .route("/api/v0/id", post(id))
            .route("/api/v0/pin/add", post(pin_add))
            .route("/api/v0/pubsub/pub", post(pubsub_pub))
            .route("/api/v0/pubsub/peers", post(pubsub_peers))
            .route("/api/v0/pubsub/sub", post(pubsub_sub))
            .with_state(state.clone());

        Self {
            server: Server::with_router(router),
            state,
        }
    }

    /// Returns the base URL of the daemon's API.
    pub fn url(&self) -> String {
        self.server.url()
    }

    /// Returns how often the given endpoint, e.g. `"pin/add"`, was hit.
    pub fn hits(&self, endpoint: &str) -> usize {
        let hits = self.state.hits.lock().unwrap();
        hits.get(endpoint).copied().unwrap_or_default()
    }

    /// Returns all hashes that were successfully pinned, in order.
    pub fn pinned(&self) -> Vec<String> {
        self.state.pinned.lock().unwrap().clone()
    }

    /// Returns the `(topic, body)` of every publication, in order.
    ///
    /// The body is the raw multipart request body.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.state.published.lock().unwrap().clone()
    }

    /// Replaces the list of peers reported for every topic.
    pub fn set_peers(&self, peers: &[&str]) {
        *self.state.peers.lock().unwrap() = peers.iter().map(|p| p.to_string()).collect();
    }

    /// Makes every following pin request fail with a server error.
    pub fn fail_pins(&self, fail: bool) {
        self.state.fail_pins.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of open pubsub subscriptions.
    pub fn subscribers(&self) -> usize {
        self.state.messages.receiver_count()
    }

    /// Delivers a pubsub message to every open subscription.
    pub fn send_message(&self, from: &str, topic: &str, data: &[u8]) {
        let message = json!({
            "from": from,
            "data": multibase(data),
            "seqno": multibase(&[0, 0, 0, 1]),
            "topicIDs": [multibase(topic.as_bytes())],
        });
        self.state.messages.send(format!("{message}\n")).ok();
    }
}
