//! The JSON messages exchanged in the pinning room.
//!
//! Clients send [`ClientAction`]s, the pinner answers with [`PinnerMessage`]s:
//!
//! ```json
//! {"type":"LOAD_STORE","payload":{"address":"/orbitdb/<root>/<name>"}}
//! {"type":"ACK","to":"<client peer id>","payload":{"acknowledgedAction":"LOAD_STORE", ...}}
//! {"type":"HAVE_HEADS","to":"/orbitdb/<root>/<name>","payload":{"address":..., "count":12, ...}}
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::StoreAddress;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Open a store and report the length of its log.
    LoadStore,
    /// Open a store and pin its content.
    PinStore,
    /// Pin a single hash.
    PinHash,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionPayload {
    pub address: Option<String>,
    pub ipfs_hash: Option<String>,
}

/// A request of a client.
///
/// The payload is not validated yet, as fields are only required by some actions.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ClientAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub payload: ActionPayload,
}

impl ClientAction {
    pub fn parse(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub acknowledged_action: ActionKind,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipfs_hash: Option<String>,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ReplicationPayload {
    pub address: StoreAddress,
    pub count: usize,
    pub timestamp: u64,
}

/// A message published by the pinner.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PinnerMessage {
    /// Confirms the receipt of a client action. Sent to the client's peer id.
    Ack { to: String, payload: AckPayload },
    /// The length of a store's log after loading it. Sent to the store address.
    HaveHeads {
        to: StoreAddress,
        payload: ReplicationPayload,
    },
    /// A store finished replicating. Sent to the store address.
    Replicated {
        to: StoreAddress,
        payload: ReplicationPayload,
    },
}

impl PinnerMessage {
    pub fn ack(action: &ClientAction, sender: &str, timestamp: u64) -> Self {
        Self::Ack {
            to: sender.to_owned(),
            payload: AckPayload {
                acknowledged_action: action.kind,
                sender: sender.to_owned(),
                address: action.payload.address.clone(),
                ipfs_hash: action.payload.ipfs_hash.clone(),
                timestamp,
            },
        }
    }

    pub fn have_heads(address: &StoreAddress, count: usize, timestamp: u64) -> Self {
        Self::HaveHeads {
            to: address.clone(),
            payload: ReplicationPayload {
                address: address.clone(),
                count,
                timestamp,
            },
        }
    }

    pub fn replicated(address: &StoreAddress, count: usize, timestamp: u64) -> Self {
        Self::Replicated {
            to: address.clone(),
            payload: ReplicationPayload {
                address: address.clone(),
                count,
                timestamp,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack { .. } => "ACK",
            Self::HaveHeads { .. } => "HAVE_HEADS",
            Self::Replicated { .. } => "REPLICATED",
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Milliseconds since the unix epoch.
pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}
