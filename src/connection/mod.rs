//! Connections to other peers: which direction a connection can be formed
//! in, and the connecting, connected and disconnected lifecycle.
//!
//! The router only forwards through connected peers.

mod connector;

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{
    methods, HandshakeRequest, HandshakeResponse, NodeId, PeerDescriptor, RequestConnectionRequest,
    RequestConnectionResponse, RequestId,
};
use crate::rpc::{Outbox, RpcError};

pub use connector::{ClientConnector, Connector, ServerConnector};

/// Version announced in handshakes.
pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// This node dialed the remote.
    Outbound,
    /// The remote dialed this node.
    Inbound,
}

#[derive(Debug, Clone)]
pub struct ManagedConnection {
    id: ConnectionId,
    peer: PeerDescriptor,
    state: ConnectionState,
    direction: ConnectionDirection,
    since: Instant,
}

impl ManagedConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// Time since the last state change.
    pub fn age(&self) -> Duration {
        self.since.elapsed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(PeerDescriptor),
    Disconnected(PeerDescriptor),
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Handshake,
    RequestConnection,
}

#[derive(Debug)]
/// Every connection of this node, keyed by remote [NodeId].
pub struct ConnectionManager {
    local: PeerDescriptor,
    client: ClientConnector,
    server: ServerConnector,
    connections: HashMap<NodeId, ManagedConnection>,
    pending: HashMap<RequestId, (NodeId, Pending)>,
    connect_timeout: Duration,
    next_id: u64,
    events: Vec<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(local: PeerDescriptor, connect_timeout: Duration) -> Self {
        Self {
            local,
            client: ClientConnector::new(),
            server: ServerConnector::new(),
            connections: HashMap::new(),
            pending: HashMap::new(),
            connect_timeout,
            next_id: 0,
            events: Vec::new(),
        }
    }

    // === Getters ===

    pub fn connection(&self, node_id: &NodeId) -> Option<&ManagedConnection> {
        self.connections.get(node_id)
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.connections
            .get(node_id)
            .map(|connection| connection.state == ConnectionState::Connected)
            .unwrap_or(false)
    }

    /// Peers with an open connection.
    pub fn connected_peers(&self) -> Vec<PeerDescriptor> {
        self.connections
            .values()
            .filter(|connection| connection.state == ConnectionState::Connected)
            .map(|connection| connection.peer.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .values()
            .filter(|connection| connection.state == ConnectionState::Connected)
            .count()
    }

    /// Returns true if `request_id` is a handshake or connection request of ours.
    pub fn owns(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    // === Public Methods ===

    /// Connect to `remote`, dialing it if possible, otherwise asking it to dial us.
    ///
    /// Returns the existing connection or attempt when there is one, and
    /// `None` if no connection can be formed in either direction.
    pub fn connect(&mut self, remote: &PeerDescriptor, outbox: &mut Outbox) -> Option<ConnectionId> {
        if remote.node_id() == self.local.node_id() {
            return None;
        }

        if let Some(connection) = self.connections.get(remote.node_id()) {
            if connection.state != ConnectionState::Disconnected {
                return Some(connection.id);
            }
        }

        if self.client.is_possible_to_form_connection(&self.local, remote) {
            let id = self.next_id();
            let (id, new) = self.client.connect(remote, id);

            if new {
                trace!(peer = ?remote.node_id(), %id, "Dialing peer");

                let request_id = outbox.call(
                    methods::HANDSHAKE,
                    &HandshakeRequest {
                        version: PROTOCOL_VERSION.to_string(),
                    },
                    remote,
                );

                self.pending
                    .insert(request_id, (*remote.node_id(), Pending::Handshake));
                self.insert(id, remote.clone(), ConnectionDirection::Outbound);
            }

            return Some(id);
        }

        if self.server.is_possible_to_form_connection(&self.local, remote) {
            let request = RequestConnectionRequest {
                ip: self.local.websocket()?.host().to_string(),
                port: self.local.websocket()?.port(),
            };

            let id = self.next_id();

            trace!(peer = ?remote.node_id(), %id, "Asking peer to dial us");

            let request_id = outbox.call(methods::REQUEST_CONNECTION, &request, remote);

            self.pending
                .insert(request_id, (*remote.node_id(), Pending::RequestConnection));
            self.insert(id, remote.clone(), ConnectionDirection::Inbound);

            return Some(id);
        }

        debug!(peer = ?remote.node_id(), "No connection can be formed with peer");

        None
    }

    /// A remote dialed us.
    pub fn on_handshake_request(
        &mut self,
        source: &PeerDescriptor,
        request: HandshakeRequest,
    ) -> HandshakeResponse {
        trace!(peer = ?source.node_id(), version = ?request.version, "Handshake request");

        if self.is_connected(source.node_id()) {
            return HandshakeResponse { accepted: true };
        }

        let id = match self.connections.get(source.node_id()) {
            Some(connection) if connection.state == ConnectionState::Connecting => connection.id,
            _ => self.next_id(),
        };

        if !self.connections.contains_key(source.node_id()) {
            self.insert(id, source.clone(), ConnectionDirection::Inbound);
        }

        self.set_state(source.node_id(), ConnectionState::Connected);

        HandshakeResponse { accepted: true }
    }

    /// A remote that cannot accept our dial asks us to dial it.
    pub fn on_request_connection(
        &mut self,
        source: &PeerDescriptor,
        request: RequestConnectionRequest,
        outbox: &mut Outbox,
    ) -> RequestConnectionResponse {
        trace!(peer = ?source.node_id(), ip = ?request.ip, port = request.port, "Connection requested");

        let accepted = self.client.is_possible_to_form_connection(&self.local, source)
            && self.connect(source, outbox).is_some();

        RequestConnectionResponse { accepted }
    }

    /// Settle one of our handshake or connection requests.
    pub fn on_response(&mut self, request_id: &RequestId, result: Result<bool, RpcError>) -> bool {
        let Some((node_id, pending)) = self.pending.remove(request_id) else {
            return false;
        };

        match (pending, result) {
            (Pending::Handshake, Ok(true)) => {
                self.set_state(&node_id, ConnectionState::Connected);
            }
            // The remote dials us back, the handshake it sends completes the connection.
            (Pending::RequestConnection, Ok(true)) => {}
            (_, result) => {
                debug!(peer = ?node_id, ?result, "Connection attempt failed");
                self.disconnect(&node_id);
            }
        }

        true
    }

    pub fn disconnect(&mut self, node_id: &NodeId) {
        if self.connections.contains_key(node_id) {
            self.set_state(node_id, ConnectionState::Disconnected);
            self.connections.remove(node_id);
        }
    }

    /// Give up attempts that are connecting for too long.
    pub fn tick(&mut self) {
        let expired = self
            .connections
            .values()
            .filter(|connection| {
                connection.state == ConnectionState::Connecting
                    && connection.age() >= self.connect_timeout
            })
            .map(|connection| *connection.peer.node_id())
            .collect::<Vec<_>>();

        for node_id in expired {
            debug!(peer = ?node_id, "Connection attempt timed out");
            self.disconnect(&node_id);
        }

        let connections = &self.connections;
        self.pending
            .retain(|_, (node_id, _)| connections.contains_key(node_id));
    }

    /// State changes since the last call.
    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    // === Private Methods ===

    fn next_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    fn insert(&mut self, id: ConnectionId, peer: PeerDescriptor, direction: ConnectionDirection) {
        self.connections.insert(
            *peer.node_id(),
            ManagedConnection {
                id,
                peer,
                state: ConnectionState::Connecting,
                direction,
                since: Instant::now(),
            },
        );
    }

    fn set_state(&mut self, node_id: &NodeId, state: ConnectionState) {
        self.client.on_state_change(node_id, state);

        let Some(connection) = self.connections.get_mut(node_id) else {
            return;
        };

        if connection.state == state {
            return;
        }

        connection.state = state;
        connection.since = Instant::now();

        match state {
            ConnectionState::Connected => {
                debug!(peer = ?node_id, id = %connection.id, direction = ?connection.direction, "Connected");
                self.events
                    .push(ConnectionEvent::Connected(connection.peer.clone()));
            }
            ConnectionState::Disconnected => {
                debug!(peer = ?node_id, id = %connection.id, "Disconnected");
                self.events
                    .push(ConnectionEvent::Disconnected(connection.peer.clone()));
            }
            ConnectionState::Connecting => {}
        }
    }
}
