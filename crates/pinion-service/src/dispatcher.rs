//! Turns client actions received in the pinning room into store operations, and announces the
//! results.

use std::sync::Arc;

use sentry::{Hub, SentryFutureExt};
use tokio::task::JoinHandle;

use crate::engine::StoreError;
use crate::events::{Event, EventStream, PubsubMessage};
use crate::node::{Node, NodeError};
use crate::protocol::{self, ActionKind, ClientAction, PinnerMessage};
use crate::stores::StoreManager;
use crate::types::{AddressError, HashError, IpfsHash, StoreAddress};

/// Reasons a client action could not be carried out.
#[derive(Debug, thiserror::Error)]
enum ActionError {
    #[error("missing payload field `{0}`")]
    MissingField(&'static str),
    #[error("invalid store address")]
    InvalidAddress(#[from] AddressError),
    #[error("invalid hash")]
    InvalidHash(#[from] HashError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl ActionError {
    fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MissingField(_) | Self::InvalidAddress(_) | Self::InvalidHash(_)
        )
    }
}

fn metric_tag(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::LoadStore => "load_store",
        ActionKind::PinStore => "pin_store",
        ActionKind::PinHash => "pin_hash",
    }
}

/// Handles the messages of the pinning room.
pub struct ProtocolDispatcher {
    node: Arc<dyn Node>,
    stores: Arc<StoreManager>,
}

impl ProtocolDispatcher {
    pub fn new(node: Arc<dyn Node>, stores: Arc<StoreManager>) -> Self {
        Self { node, stores }
    }

    /// Consumes `events` in a background task until the event bus is gone or the task is aborted.
    ///
    /// Every message is handled in a task of its own, so a slow store does not hold up others.
    pub fn spawn(self: Arc<Self>, events: EventStream) -> JoinHandle<()> {
        tokio::spawn(
            self.run(events)
                .bind_hub(Hub::new_from_top(Hub::current())),
        )
    }

    async fn run(self: Arc<Self>, mut events: EventStream) {
        while let Some(event) = events.next().await {
            match event {
                Event::Message(message) => {
                    let dispatcher = Arc::clone(&self);
                    tokio::spawn(
                        async move { dispatcher.handle_message(message).await }
                            .bind_hub(Hub::new_from_top(Hub::current())),
                    );
                }
                Event::StoreReplicated { address, heads } => {
                    let timestamp = protocol::timestamp();
                    self.publish(&PinnerMessage::replicated(&address, heads, timestamp))
                        .await;
                }
                Event::PeerJoined(peer) => tracing::debug!(%peer, "peer joined"),
                Event::PeerLeft(peer) => tracing::debug!(%peer, "peer left"),
            }
        }
        tracing::debug!("event bus closed, dispatcher stopped");
    }

    /// Handles a single message of a client.
    ///
    /// Messages that are not valid actions are dropped. Valid actions are acknowledged before
    /// they are carried out.
    pub async fn handle_message(&self, message: PubsubMessage) {
        let action = match ClientAction::parse(&message.data) {
            Ok(action) => action,
            Err(error) => {
                metric!(counter("actions.malformed") += 1);
                tracing::warn!(
                    from = %message.from,
                    error = &error as &dyn std::error::Error,
                    "dropping malformed message"
                );
                return;
            }
        };

        let tag = metric_tag(action.kind);
        metric!(counter("actions.received") += 1, "action" => tag);
        tracing::debug!(from = %message.from, ?action, "received action");

        self.publish(&PinnerMessage::ack(
            &action,
            &message.from,
            protocol::timestamp(),
        ))
        .await;

        if let Err(error) = self.dispatch(&action).await {
            let status = if error.is_client_error() {
                "invalid"
            } else {
                "failed"
            };
            metric!(counter("actions.failed") += 1, "action" => tag, "status" => status);
            if error.is_client_error() {
                tracing::warn!(
                    from = %message.from,
                    ?action,
                    error = &error as &dyn std::error::Error,
                    "dropping invalid action"
                );
            } else {
                tracing::error!(
                    from = %message.from,
                    ?action,
                    error = &error as &dyn std::error::Error,
                    "failed to handle action"
                );
            }
        }
    }

    async fn dispatch(&self, action: &ClientAction) -> Result<(), ActionError> {
        match action.kind {
            ActionKind::PinHash => {
                let hash = action
                    .payload
                    .ipfs_hash
                    .as_deref()
                    .ok_or(ActionError::MissingField("ipfsHash"))?;
                let hash = IpfsHash::parse(hash)?;
                self.node.pin(&hash).await?;
                tracing::info!(hash = %hash, "pinned hash");
            }
            ActionKind::PinStore => {
                let address = Self::address(action)?;
                self.stores.pin_store(&address).await?;
            }
            ActionKind::LoadStore => {
                let address = Self::address(action)?;
                let count = self.stores.load_store(&address).await?;
                self.publish(&PinnerMessage::have_heads(
                    &address,
                    count,
                    protocol::timestamp(),
                ))
                .await;
            }
        }
        Ok(())
    }

    fn address(action: &ClientAction) -> Result<StoreAddress, ActionError> {
        let address = action
            .payload
            .address
            .as_deref()
            .ok_or(ActionError::MissingField("address"))?;
        Ok(StoreAddress::parse(address)?)
    }

    /// Publishes `message` to the pinning room. Failures are logged.
    async fn publish(&self, message: &PinnerMessage) {
        let bytes = match message.to_vec() {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(
                    kind = message.kind(),
                    error = &error as &dyn std::error::Error,
                    "failed to serialize message"
                );
                return;
            }
        };

        match self.node.publish(bytes).await {
            Ok(()) => {
                metric!(counter("messages.published") += 1, "type" => message.kind());
            }
            Err(error) => {
                metric!(counter("messages.failed") += 1, "type" => message.kind());
                tracing::error!(
                    kind = message.kind(),
                    error = &error as &dyn std::error::Error,
                    "failed to publish message"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::config::StoresConfig;
    use crate::events::EventBus;
    use crate::test::{self, HASHES, MockEngine, RecordingNode};

    const CLIENT: &str = "QmClientPeer";

    struct Fixture {
        engine: Arc<MockEngine>,
        node: Arc<RecordingNode>,
        bus: EventBus,
        dispatcher: Arc<ProtocolDispatcher>,
    }

    async fn fixture() -> Fixture {
        pinion_test::setup();
        let engine = MockEngine::new();
        let node = RecordingNode::new();
        let bus = EventBus::new();
        let stores = Arc::new(StoreManager::new(
            engine.clone(),
            node.clone(),
            bus.clone(),
            &StoresConfig::default(),
        ));
        stores.start().await.unwrap();
        let dispatcher = Arc::new(ProtocolDispatcher::new(node.clone(), stores));

        Fixture {
            engine,
            node,
            bus,
            dispatcher,
        }
    }

    fn message(action: serde_json::Value) -> PubsubMessage {
        PubsubMessage {
            from: CLIENT.into(),
            data: Bytes::from(action.to_string()),
        }
    }

    fn types(published: &[serde_json::Value]) -> Vec<&str> {
        published
            .iter()
            .map(|message| message["type"].as_str().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_pin_hash() {
        let f = fixture().await;
        f.dispatcher
            .handle_message(message(json!({
                "type": "PIN_HASH",
                "payload": { "ipfsHash": HASHES[0] }
            })))
            .await;

        assert_eq!(f.node.pinned(), [HASHES[0]]);

        let published = f.node.published();
        assert_eq!(types(&published), ["ACK"]);
        let ack = &published[0];
        assert_eq!(ack["to"], CLIENT);
        assert_eq!(ack["payload"]["acknowledgedAction"], "PIN_HASH");
        assert_eq!(ack["payload"]["sender"], CLIENT);
        assert_eq!(ack["payload"]["ipfsHash"], HASHES[0]);
        assert!(ack["payload"].get("address").is_none());
        assert!(ack["payload"]["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_invalid_hash_is_acked_not_pinned() {
        let f = fixture().await;
        f.dispatcher
            .handle_message(message(json!({
                "type": "PIN_HASH",
                "payload": { "ipfsHash": "definitely not a hash" }
            })))
            .await;

        assert!(f.node.pinned().is_empty());
        assert_eq!(types(&f.node.published()), ["ACK"]);
    }

    #[tokio::test]
    async fn test_load_store() {
        let f = fixture().await;
        let address = test::address("load");

        f.dispatcher
            .handle_message(message(json!({
                "type": "LOAD_STORE",
                "payload": { "address": address.as_str() }
            })))
            .await;

        let published = f.node.published();
        assert_eq!(types(&published), ["ACK", "HAVE_HEADS"]);
        assert_eq!(published[0]["payload"]["address"], address.as_str());

        let heads = &published[1];
        assert_eq!(heads["to"], address.as_str());
        assert_eq!(heads["payload"]["address"], address.as_str());
        assert_eq!(heads["payload"]["count"], 0);
        assert_eq!(f.engine.opens(), 1);
    }

    #[tokio::test]
    async fn test_pin_store() {
        let f = fixture().await;
        let address = test::address("pin");

        f.dispatcher
            .handle_message(message(json!({
                "type": "PIN_STORE",
                "payload": { "address": address.as_str() }
            })))
            .await;

        assert_eq!(types(&f.node.published()), ["ACK"]);
        let store = f.engine.store(&address).unwrap();
        store.replicate_progress(HASHES[1]);
        test::wait_until(|| f.node.pinned() == [HASHES[1]]).await;
    }

    #[tokio::test]
    async fn test_invalid_actions_reach_no_store() {
        let f = fixture().await;

        for action in [
            json!({ "type": "LOAD_STORE", "payload": {} }),
            json!({ "type": "PIN_STORE", "payload": { "address": "/ipfs/nope" } }),
            json!({ "type": "PIN_HASH" }),
        ] {
            f.dispatcher.handle_message(message(action)).await;
        }

        // every action is acknowledged, but nothing else happens
        assert_eq!(types(&f.node.published()), ["ACK", "ACK", "ACK"]);
        assert_eq!(f.engine.opens(), 0);
        assert!(f.node.pinned().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_messages_are_dropped() {
        let f = fixture().await;

        for data in [
            Bytes::from_static(b"not json"),
            Bytes::from_static(br#"{"type":"UNPIN_STORE","payload":{}}"#),
            Bytes::from_static(br#"{"type":42,"payload":{}}"#),
        ] {
            f.dispatcher
                .handle_message(PubsubMessage {
                    from: CLIENT.into(),
                    data,
                })
                .await;
        }

        assert!(f.node.published().is_empty());
        assert_eq!(f.engine.opens(), 0);
    }

    #[tokio::test]
    async fn test_failed_ack_does_not_stop_handling() {
        let f = fixture().await;
        f.node.fail_publish(true);

        f.dispatcher
            .handle_message(message(json!({
                "type": "PIN_HASH",
                "payload": { "ipfsHash": HASHES[2] }
            })))
            .await;

        assert!(f.node.published().is_empty());
        assert_eq!(f.node.pinned(), [HASHES[2]]);
    }

    #[tokio::test]
    async fn test_failed_open_publishes_no_heads() {
        let f = fixture().await;
        let address = test::address("denied");
        f.engine.reject(&address);

        f.dispatcher
            .handle_message(message(json!({
                "type": "LOAD_STORE",
                "payload": { "address": address.as_str() }
            })))
            .await;

        assert_eq!(types(&f.node.published()), ["ACK"]);
    }

    #[tokio::test]
    async fn test_run_announces_replication() {
        let f = fixture().await;
        let address = test::address("announce");
        let task = Arc::clone(&f.dispatcher).spawn(f.bus.subscribe());

        f.bus.emit(Event::Message(message(json!({
            "type": "PIN_STORE",
            "payload": { "address": address.as_str() }
        }))));
        test::wait_until(|| f.engine.store(&address).is_some()).await;

        let store = f.engine.store(&address).unwrap();
        store.replicate_progress(HASHES[0]);
        store.replicated(4);
        test::wait_until(|| f.node.published().len() == 2).await;

        let published = f.node.published();
        assert_eq!(types(&published), ["ACK", "REPLICATED"]);
        assert_eq!(published[1]["to"], address.as_str());
        assert_eq!(published[1]["payload"]["count"], 4);

        task.abort();
    }
}
