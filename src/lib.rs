#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod dht;
mod error;

pub mod actor;
#[cfg(feature = "async")]
pub mod async_dht;
pub mod connection;
pub mod finder;
pub mod router;
pub mod rpc;
pub mod store;
pub mod transport;

pub use crate::common::{
    ConnectivityMethod, DataEntry, Message, MessageBody, NodeId, NodeType, PeerDescriptor,
    RecursiveOperation, RequestId, RouteMessageAck, RouteMessageError, RoutingTable, RpcMessage,
    RpcPayload, DHT_SERVICE_ID, ID_SIZE, MAX_BUCKET_SIZE_K,
};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, DhtLookupError, DhtStoreError, DhtWasShutdown, Testnet};
pub use error::{Error, Result};

pub mod errors {
    //! Exported errors
    pub use super::finder::LookupError;
    pub use super::rpc::RpcError;
    pub use super::store::StoreError;
    pub use super::transport::TransportError;
}
