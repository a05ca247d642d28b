use std::time::Duration;

use crate::common::{PeerDescriptor, DHT_SERVICE_ID, MAX_BUCKET_SIZE_K};
use crate::finder::{DEFAULT_LOOKUP_TIMEOUT, DEFAULT_MAX_LOOKUP_ROUNDS};
use crate::router::{DEFAULT_DUPLICATE_DETECTOR_CAPACITY, DEFAULT_DUPLICATE_DETECTOR_RETENTION};
use crate::rpc::DEFAULT_RPC_REQUEST_TIMEOUT;
use crate::store::{DEFAULT_STORE_HIGHEST_TTL, DEFAULT_STORE_MAX_TTL, DEFAULT_STORE_NUMBER_OF_COPIES};
use crate::transport::Transport;

/// Default host advertised in this node's websocket connectivity.
pub const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug)]
/// Dht Configurations
pub struct Config {
    /// This node's own descriptor.
    ///
    /// Defaults to None, where a random [crate::NodeId] is used, advertising
    /// [Self::host] and the bound port as a plain websocket listener.
    pub peer_descriptor: Option<PeerDescriptor>,
    /// Host advertised when [Self::peer_descriptor] is not set.
    ///
    /// Defaults to [DEFAULT_HOST]
    pub host: String,
    /// Explicit UDP port to listen on.
    ///
    /// Defaults to None
    pub port: Option<u16>,
    /// Peers seeding the bootstrapping lookup of this node's own id.
    ///
    /// Defaults to none, this node starts a new network.
    pub entry_points: Vec<PeerDescriptor>,
    /// Service id of DHT messages.
    ///
    /// Defaults to [DHT_SERVICE_ID]
    pub service_id: String,
    /// Transport to use instead of a UDP socket.
    ///
    /// Defaults to None
    pub transport: Option<Box<dyn Transport>>,
    /// Deadline of a single rpc request.
    ///
    /// Defaults to [DEFAULT_RPC_REQUEST_TIMEOUT]
    pub rpc_request_timeout: Duration,
    /// Highest ttl accepted for entries stored on behalf of other peers.
    ///
    /// Defaults to [DEFAULT_STORE_MAX_TTL]
    pub store_max_ttl: Duration,
    /// Highest ttl, and the default one, of entries created by this node.
    ///
    /// Defaults to [DEFAULT_STORE_HIGHEST_TTL]
    pub store_highest_ttl: Duration,
    /// Number of peers an entry is stored on.
    ///
    /// Defaults to [DEFAULT_STORE_NUMBER_OF_COPIES]
    pub store_number_of_copies: usize,
    /// Peers queried in parallel in each lookup round.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub lookup_parallelism: usize,
    /// Deadline of a whole lookup.
    ///
    /// Defaults to [DEFAULT_LOOKUP_TIMEOUT]
    pub lookup_timeout: Duration,
    /// Budget of sequential rounds per lookup.
    ///
    /// Defaults to [DEFAULT_MAX_LOOKUP_ROUNDS]
    pub max_lookup_rounds: usize,
    /// Routing attempts remembered for duplicate detection.
    ///
    /// Defaults to [DEFAULT_DUPLICATE_DETECTOR_CAPACITY]
    pub duplicate_detector_capacity: usize,
    /// How long a routing attempt is remembered.
    ///
    /// Defaults to [DEFAULT_DUPLICATE_DETECTOR_RETENTION]
    pub duplicate_detector_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_descriptor: None,
            host: DEFAULT_HOST.to_string(),
            port: None,
            entry_points: Vec::new(),
            service_id: DHT_SERVICE_ID.to_string(),
            transport: None,
            rpc_request_timeout: DEFAULT_RPC_REQUEST_TIMEOUT,
            store_max_ttl: DEFAULT_STORE_MAX_TTL,
            store_highest_ttl: DEFAULT_STORE_HIGHEST_TTL,
            store_number_of_copies: DEFAULT_STORE_NUMBER_OF_COPIES,
            lookup_parallelism: MAX_BUCKET_SIZE_K,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            max_lookup_rounds: DEFAULT_MAX_LOOKUP_ROUNDS,
            duplicate_detector_capacity: DEFAULT_DUPLICATE_DETECTOR_CAPACITY,
            duplicate_detector_retention: DEFAULT_DUPLICATE_DETECTOR_RETENTION,
        }
    }
}
