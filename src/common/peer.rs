//! Addressable description of an overlay participant.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::common::{bool_int, NodeId};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
/// Runtime environment of a node.
pub enum NodeType {
    /// A native process that may listen for inbound connections.
    Native,
    /// A browser node, which can never accept inbound connections.
    Browser,
}

impl From<NodeType> for u8 {
    fn from(value: NodeType) -> Self {
        match value {
            NodeType::Native => 0,
            NodeType::Browser => 1,
        }
    }
}

impl TryFrom<u8> for NodeType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeType::Native),
            1 => Ok(NodeType::Browser),
            other => Err(Error::UnknownVariant("NodeType", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A websocket listener advertised by a peer.
pub struct ConnectivityMethod {
    host: String,
    port: u16,
    #[serde(default, with = "bool_int")]
    tls: bool,
}

impl ConnectivityMethod {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    /// `host:port`, suitable for address resolution.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Addressable, type-tagged description of a DHT participant.
///
/// Two descriptors are equal when their [NodeId]s are equal, regardless of
/// any other field.
pub struct PeerDescriptor {
    #[serde(rename = "id")]
    node_id: NodeId,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    websocket: Option<ConnectivityMethod>,
}

impl PeerDescriptor {
    pub fn new(node_id: NodeId, node_type: NodeType) -> Self {
        Self {
            node_id,
            node_type,
            region: None,
            websocket: None,
        }
    }

    /// A native peer with a random [NodeId] and no listener.
    pub fn random() -> Self {
        Self::new(NodeId::random(), NodeType::Native)
    }

    /// A native entry point whose Id is derived from its address, so every node
    /// configured with the same `host:port` agrees on it.
    pub fn entry_point(host: &str, port: u16, tls: bool) -> Self {
        Self::new(
            NodeId::from_seed(format!("{host}:{port}")),
            NodeType::Native,
        )
        .with_websocket(ConnectivityMethod::new(host, port, tls))
    }

    pub fn with_websocket(mut self, websocket: ConnectivityMethod) -> Self {
        self.websocket = Some(websocket);
        self
    }

    pub fn with_region(mut self, region: u32) -> Self {
        self.region = Some(region);
        self
    }

    // === Getters ===

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn region(&self) -> Option<u32> {
        self.region
    }

    pub fn websocket(&self) -> Option<&ConnectivityMethod> {
        self.websocket.as_ref()
    }

    pub fn is_browser(&self) -> bool {
        self.node_type == NodeType::Browser
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state)
    }
}
