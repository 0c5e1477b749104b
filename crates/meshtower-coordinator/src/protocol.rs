//! JSON wire messages exchanged on zone channels
//!
//! Agents publish a [`MsgEvent`] wrapping their [`Peer`] record:
//!
//! ```text
//! {"Event": "register-node-request",
//!  "Peer": {"PublicKey": "...", "EndpointIP": "...", "AllowedIPs": "..."}}
//! ```
//!
//! The coordinator answers on the same channel with the complete peer set of
//! the zone as a bare JSON array of [`Peer`] objects.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Agent -> coordinator registration event
pub const REGISTER_NODE_REQUEST: &str = "register-node-request";

/// Name of the coordinator -> agents snapshot broadcast
pub const PEER_LIST: &str = "peer-list";

/// A peer as it travels on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// WireGuard public key, the peer's identity
    #[serde(rename = "PublicKey", default)]
    pub public_key: String,

    /// Last reported public endpoint (`host:port`)
    #[serde(rename = "EndpointIP", default)]
    pub endpoint_ip: String,

    /// Routes this peer accepts traffic for
    #[serde(rename = "AllowedIPs", default)]
    pub allowed_ips: String,

    /// Zone the peer belongs to
    #[serde(rename = "Zone", default)]
    pub zone: String,

    /// Overlay address; on a request, the address the agent asks for
    #[serde(rename = "NodeAddress", default)]
    pub node_address: String,

    /// Prefix delegated to the peer; on a request, the prefix it asks for
    #[serde(rename = "ChildPrefix", default)]
    pub child_prefix: String,
}

impl Peer {
    pub fn new(public_key: impl Into<String>, endpoint_ip: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            endpoint_ip: endpoint_ip.into(),
            ..Default::default()
        }
    }

    pub fn with_node_address(mut self, address: impl Into<String>) -> Self {
        self.node_address = address.into();
        self
    }

    pub fn with_child_prefix(mut self, cidr: impl Into<String>) -> Self {
        self.child_prefix = cidr.into();
        self
    }
}

/// Event envelope published by agents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgEvent {
    #[serde(rename = "Event")]
    pub event: String,

    #[serde(rename = "Peer", default)]
    pub peer: Peer,
}

impl MsgEvent {
    /// Registration request for `peer`
    pub fn register(peer: Peer) -> Self {
        Self {
            event: REGISTER_NODE_REQUEST.to_string(),
            peer,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// A decoded message from a zone channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Registration request with a non-empty public key
    Register(Peer),
    /// A full snapshot, usually this coordinator's own broadcast echoed back
    PeerList(Vec<Peer>),
}

/// Decode one raw payload from a zone channel
pub fn decode(payload: &[u8]) -> Result<Inbound, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if value.is_array() {
        let peers: Vec<Peer> =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        return Ok(Inbound::PeerList(peers));
    }

    let message: MsgEvent =
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    match message.event.as_str() {
        REGISTER_NODE_REQUEST => {
            if message.peer.public_key.trim().is_empty() {
                return Err(ProtocolError::Malformed(
                    "registration without a public key".to_string(),
                ));
            }
            Ok(Inbound::Register(message.peer))
        }
        other => Err(ProtocolError::UnknownEvent(other.to_string())),
    }
}

/// Encode a full snapshot broadcast
pub fn encode_peer_list(peers: &[Peer]) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(peers)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}
