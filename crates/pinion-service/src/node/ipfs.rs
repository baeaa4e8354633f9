//! A [`Node`] backed by the HTTP RPC API of an IPFS daemon.

use std::collections::BTreeSet;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::TryStreamExt;
use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use sentry::{Hub, SentryFutureExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use url::Url;

use crate::config::IpfsConfig;
use crate::events::{Event, EventBus, PubsubMessage};
use crate::types::IpfsHash;

use super::{Node, NodeError};

#[derive(Debug, Deserialize)]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct PeersResponse {
    #[serde(rename = "Strings", default)]
    peers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Message")]
    message: String,
}

/// A message as streamed by `pubsub/sub`.
#[derive(Debug, Deserialize)]
struct RawMessage {
    from: String,
    data: String,
}

/// Encodes bytes in the multibase `base64url` encoding used by the pubsub API.
fn multibase_encode(data: &[u8]) -> String {
    format!("u{}", URL_SAFE_NO_PAD.encode(data))
}

fn multibase_decode(data: &str) -> Result<Vec<u8>, NodeError> {
    let encoded = data
        .strip_prefix('u')
        .ok_or_else(|| NodeError::InvalidMessage(format!("unsupported multibase: {data}")))?;
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| NodeError::InvalidMessage(e.to_string()))
}

#[derive(Debug, Default)]
struct NodeState {
    id: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

/// A client for the HTTP RPC API of an IPFS daemon.
///
/// The pinning room is a pubsub topic. While started, the node keeps a subscription to it open,
/// and polls its peers to detect joins and leaves.
#[derive(Debug)]
pub struct IpfsNode {
    client: Client,
    api: Url,
    room: String,
    request_timeout: Duration,
    peer_poll_interval: Duration,
    bus: EventBus,
    state: Mutex<NodeState>,
}

impl IpfsNode {
    pub fn new(config: &IpfsConfig, room: &str, bus: EventBus) -> Result<Self, NodeError> {
        Ok(Self {
            client: Client::new(),
            api: config.daemon_url.join("api/v0/")?,
            room: room.to_owned(),
            request_timeout: config.request_timeout,
            peer_poll_interval: config.peer_poll_interval,
            bus,
            state: Mutex::new(NodeState::default()),
        })
    }

    fn request(&self, endpoint: &str, arg: &str) -> Result<RequestBuilder, NodeError> {
        let url = self.api.join(endpoint)?;
        Ok(self.client.post(url).query(&[("arg", arg)]))
    }

    fn topic(&self) -> String {
        multibase_encode(self.room.as_bytes())
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, NodeError> {
        let response = send(request.timeout(self.request_timeout)).await?;
        Ok(response.json().await?)
    }

    async fn subscribe(&self, own_id: String) -> Result<JoinHandle<()>, NodeError> {
        let request = self.request("pubsub/sub", &self.topic())?;
        let response = send(request).await?;
        tracing::info!(room = %self.room, "joined pinning room");

        let stream = response.bytes_stream().map_err(io::Error::other);
        let mut lines = StreamReader::new(Box::pin(stream)).lines();
        let bus = self.bus.clone();

        let task = async move {
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(error) => {
                        tracing::error!(
                            error = &error as &dyn std::error::Error,
                            "pubsub subscription failed"
                        );
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match parse_message(&line) {
                    // Don't handle messages from ourselves
                    Ok(message) if message.from == own_id => {}
                    Ok(message) => {
                        tracing::debug!(from = %message.from, "received pubsub message");
                        bus.emit(Event::Message(message));
                    }
                    Err(error) => tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "dropping invalid pubsub message"
                    ),
                }
            }
            tracing::info!("pubsub subscription ended");
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        Ok(tokio::spawn(task))
    }

    fn monitor_peers(&self) -> Result<JoinHandle<()>, NodeError> {
        let request = self.request("pubsub/peers", &self.topic())?;
        let timeout = self.request_timeout;
        let poll_interval = self.peer_poll_interval;
        let bus = self.bus.clone();

        let task = async move {
            let mut peers = BTreeSet::new();
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(request) = request.try_clone() else {
                    break;
                };
                let response = match send(request.timeout(timeout)).await {
                    Ok(response) => response.json::<PeersResponse>().await,
                    Err(error) => {
                        tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            "failed to poll room peers"
                        );
                        continue;
                    }
                };
                let current: BTreeSet<String> = match response {
                    Ok(response) => response.peers.unwrap_or_default().into_iter().collect(),
                    Err(error) => {
                        tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            "invalid room peers response"
                        );
                        continue;
                    }
                };

                for peer in current.difference(&peers) {
                    tracing::debug!(%peer, "peer joined");
                    bus.emit(Event::PeerJoined(peer.clone()));
                }
                for peer in peers.difference(&current) {
                    tracing::debug!(%peer, "peer left");
                    bus.emit(Event::PeerLeft(peer.clone()));
                }
                peers = current;
            }
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        Ok(tokio::spawn(task))
    }
}

/// Sends the request, turning error responses of the daemon into [`NodeError::Daemon`].
async fn send(request: RequestBuilder) -> Result<Response, NodeError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(error) => error.message,
        Err(_) => body,
    };
    Err(NodeError::Daemon {
        status: status.as_u16(),
        message,
    })
}

fn parse_message(line: &str) -> Result<PubsubMessage, NodeError> {
    let raw: RawMessage =
        serde_json::from_str(line).map_err(|e| NodeError::InvalidMessage(e.to_string()))?;
    if raw.from.is_empty() {
        return Err(NodeError::InvalidMessage("message has no sender".into()));
    }
    Ok(PubsubMessage {
        from: raw.from,
        data: multibase_decode(&raw.data)?.into(),
    })
}

#[async_trait]
impl Node for IpfsNode {
    async fn id(&self) -> Result<String, NodeError> {
        let response: IdResponse = self.call(self.client.post(self.api.join("id")?)).await?;
        Ok(response.id)
    }

    async fn pin(&self, hash: &IpfsHash) -> Result<(), NodeError> {
        tracing::debug!(hash = %hash, "pinning hash");
        let request = self.request("pin/add", hash.as_str())?;
        send(request.timeout(self.request_timeout)).await?;
        metric!(counter("node.pinned") += 1);
        Ok(())
    }

    async fn publish(&self, message: Vec<u8>) -> Result<(), NodeError> {
        tracing::trace!(room = %self.room, data = %String::from_utf8_lossy(&message), "publishing");
        let form = Form::new().part("data", Part::bytes(message).file_name("data"));
        let request = self.request("pubsub/pub", &self.topic())?.multipart(form);
        send(request.timeout(self.request_timeout)).await?;
        Ok(())
    }

    async fn start(&self) -> Result<(), NodeError> {
        let id = self.id().await?;
        tracing::info!(id = %id, "connected to IPFS daemon");

        let subscription = self.subscribe(id.clone()).await?;
        let monitor = self.monitor_peers()?;

        let mut state = self.state.lock();
        state.id = Some(id);
        state.tasks.extend([subscription, monitor]);
        Ok(())
    }

    async fn stop(&self) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        for task in state.tasks.drain(..) {
            task.abort();
        }
        if state.id.take().is_some() {
            tracing::info!(room = %self.room, "left pinning room");
        }
        Ok(())
    }
}

impl Drop for IpfsNode {
    fn drop(&mut self) {
        for task in self.state.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}
