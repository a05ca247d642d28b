//! Messages exchanged between overlay nodes, and the typed payloads of every
//! RPC method.
//!
//! [Message] is the envelope delivered by a [crate::transport::Transport] and
//! routed hop by hop inside a [RouteMessageWrapper]. Its body is a tagged
//! union, so every consumer must match all variants.

mod internal;

use std::fmt::{self, Debug, Display, Formatter};

use bytes::Bytes;
use rand::Rng;
use serde::{de::DeserializeOwned, de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

use crate::common::{bool_int, NodeId, PeerDescriptor};
use crate::{Error, Result};

/// Service id of the DHT's own RPC surface.
pub const DHT_SERVICE_ID: &str = "layer0";

/// Names of the RPC methods a node registers.
pub mod methods {
    pub const PING: &str = "ping";
    pub const GET_CLOSEST_PEERS: &str = "getClosestPeers";
    pub const FIND_DATA: &str = "findData";
    pub const ROUTE_MESSAGE: &str = "routeMessage";
    pub const FORWARD_MESSAGE: &str = "forwardMessage";
    pub const FIND_RECURSIVELY: &str = "findRecursively";
    pub const SEND_RECURSIVE_OPERATION_RESPONSE: &str = "sendRecursiveOperationResponse";
    pub const STORE_DATA: &str = "storeData";
    pub const DELETE_DATA: &str = "deleteData";
    pub const REPLICATE_DATA: &str = "replicateData";
    pub const HANDSHAKE: &str = "handshake";
    pub const REQUEST_CONNECTION: &str = "requestConnection";
}

const REQUEST_ID_SIZE: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Identity of a single request, message, routing attempt or session.
pub struct RequestId([u8; REQUEST_ID_SIZE]);

impl RequestId {
    pub fn random() -> Self {
        RequestId(rand::thread_rng().gen())
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({self})")
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<RequestId, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;

        let id: [u8; REQUEST_ID_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::invalid_length(bytes.len(), &"8 bytes"))?;

        Ok(RequestId(id))
    }
}

// === Envelope ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "internal::WireMessage", try_from = "internal::WireMessage")]
/// The outer envelope routed between nodes.
pub struct Message {
    pub service_id: String,
    pub message_id: RequestId,
    pub body: MessageBody,
    pub source: PeerDescriptor,
    pub target: Option<PeerDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
/// Exactly one payload per [Message].
pub enum MessageBody {
    Rpc(RpcMessage),
    FindRequest(FindRequest),
    RecursiveOperationRequest(RecursiveOperationRequest),
}

impl Message {
    pub fn new(
        service_id: impl Into<String>,
        source: PeerDescriptor,
        target: Option<PeerDescriptor>,
        body: MessageBody,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            message_id: RequestId::random(),
            body,
            source,
            target,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Ok(serde_bencode::from_bytes(bytes.as_ref())?)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A request, response or error of the [crate::rpc::RpcCommunicator].
pub struct RpcMessage {
    pub request_id: RequestId,
    pub method: String,
    pub payload: RpcPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcPayload {
    /// Bencoded request body.
    Request(Bytes),
    /// Bencoded response body.
    Response(Bytes),
    Error {
        code: RpcErrorCode,
        description: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    /// No handler is registered for the invoked method.
    UnknownRpcMethod,
    /// The handler failed.
    ServerError,
}

impl From<RpcErrorCode> for u8 {
    fn from(value: RpcErrorCode) -> Self {
        match value {
            RpcErrorCode::UnknownRpcMethod => 1,
            RpcErrorCode::ServerError => 2,
        }
    }
}

impl TryFrom<u8> for RpcErrorCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RpcErrorCode::UnknownRpcMethod),
            2 => Ok(RpcErrorCode::ServerError),
            other => Err(Error::UnknownVariant("RpcErrorCode", other)),
        }
    }
}

// === Routing ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A [Message] in transit across the overlay.
pub struct RouteMessageWrapper {
    pub message: Message,
    /// Identity of this routing attempt, the duplicate detection key.
    pub request_id: RequestId,
    pub source_peer: PeerDescriptor,
    pub target: NodeId,
    /// Peers already traversed, in order.
    #[serde(default)]
    pub routing_path: Vec<PeerDescriptor>,
    /// Relays through which the source can be reached.
    #[serde(default)]
    pub reachable_through: Vec<PeerDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMessageAck {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RouteMessageError>,
}

impl RouteMessageAck {
    pub fn ok(request_id: RequestId) -> Self {
        Self {
            request_id,
            error: None,
        }
    }

    pub fn error(request_id: RequestId, error: RouteMessageError) -> Self {
        Self {
            request_id,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RouteMessageError {
    /// No open connection leads closer to the target.
    NoTargets,
    /// This routing attempt was already seen.
    Duplicate,
    /// The router is stopped.
    Stopped,
}

impl From<RouteMessageError> for u8 {
    fn from(value: RouteMessageError) -> Self {
        match value {
            RouteMessageError::NoTargets => 1,
            RouteMessageError::Duplicate => 2,
            RouteMessageError::Stopped => 3,
        }
    }
}

impl TryFrom<u8> for RouteMessageError {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RouteMessageError::NoTargets),
            2 => Ok(RouteMessageError::Duplicate),
            3 => Ok(RouteMessageError::Stopped),
            other => Err(Error::UnknownVariant("RouteMessageError", other)),
        }
    }
}

// === Recursive operations ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RecursiveOperation {
    FindClosestNodes,
    FindData,
    StoreData,
}

impl From<RecursiveOperation> for u8 {
    fn from(value: RecursiveOperation) -> Self {
        match value {
            RecursiveOperation::FindClosestNodes => 0,
            RecursiveOperation::FindData => 1,
            RecursiveOperation::StoreData => 2,
        }
    }
}

impl TryFrom<u8> for RecursiveOperation {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RecursiveOperation::FindClosestNodes),
            1 => Ok(RecursiveOperation::FindData),
            2 => Ok(RecursiveOperation::StoreData),
            other => Err(Error::UnknownVariant("RecursiveOperation", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Routed request for the peers closest to the wrapper's target.
pub struct FindRequest {
    pub session_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecursiveOperationRequest {
    pub session_id: RequestId,
    pub operation: RecursiveOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Reported by every hop of a recursive operation straight to its origin.
pub struct RecursiveOperationResponse {
    pub session_id: RequestId,
    #[serde(default)]
    pub closest_connected_peers: Vec<PeerDescriptor>,
    #[serde(default)]
    pub data_entries: Vec<DataEntry>,
    #[serde(default)]
    pub routing_path: Vec<PeerDescriptor>,
    #[serde(default, with = "bool_int")]
    pub no_closer_nodes_found: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Replicated record stored under a key.
pub struct DataEntry {
    pub key: NodeId,
    pub data: Bytes,
    pub creator: PeerDescriptor,
    /// Time to live in milliseconds.
    pub ttl: u64,
    /// Creation time, milliseconds since the unix epoch.
    pub created_at: u64,
    #[serde(default, with = "bool_int")]
    pub stale: bool,
    #[serde(default, with = "bool_int")]
    pub deleted: bool,
}

// === RPC payloads ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosestPeersRequest {
    pub node_id: NodeId,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosestPeersResponse {
    #[serde(default)]
    pub peers: Vec<PeerDescriptor>,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindDataRequest {
    pub key: NodeId,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindDataResponse {
    #[serde(default)]
    pub peers: Vec<PeerDescriptor>,
    #[serde(default)]
    pub entries: Vec<DataEntry>,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDataRequest {
    pub key: NodeId,
    pub data: Bytes,
    /// Requested time to live in milliseconds.
    pub ttl: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDataResponse {
    /// Empty on success.
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteDataRequest {
    pub key: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteDataResponse {
    #[serde(default, with = "bool_int")]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateDataRequest {
    pub entry: DataEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, with = "bool_int")]
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConnectionRequest {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConnectionResponse {
    #[serde(default, with = "bool_int")]
    pub accepted: bool,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(serde_bencode::to_bytes(value)?.into())
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_bencode::from_bytes(bytes)?)
}
