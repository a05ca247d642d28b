//! Actor implementation - the single owner of a node's state, advanced by [Actor::tick].

pub(crate) mod config;
mod handle_request;
mod handle_response;
mod info;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::common::{
    methods, ConnectivityMethod, DataEntry, Message, MessageBody, NodeId, PeerDescriptor,
    PingRequest, RecursiveOperation, RequestId, RouteMessageAck, RouteMessageWrapper,
    RoutingTable,
};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::finder::{Finder, LookupError, RecursiveOperationResult};
use crate::router::{DuplicateDetector, Router, RouterIo, RoutingMode};
use crate::rpc::{Outbox, RpcCommunicator};
use crate::store::{LocalDataStore, StoreError, StoreManager};
use crate::transport::{Transport, UdpTransport, DEFAULT_PORT};
use crate::Result;

pub use config::{Config, DEFAULT_HOST};
pub use info::Info;

/// How often expired entries are swept from the [LocalDataStore].
const STORE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the RPC handlers operate on.
#[derive(Debug)]
pub(crate) struct NodeState {
    local: PeerDescriptor,
    routing_table: RoutingTable,
    connections: ConnectionManager,
    router: Router,
    finder: Finder,
    store_manager: StoreManager,
    local_store: LocalDataStore,
    /// Routed messages addressed to this node, drained every tick.
    delivered: Vec<Message>,
}

impl NodeState {
    /// Remember a peer we heard from, connecting to it and handing it the
    /// entries it should now hold.
    fn add_contact(&mut self, peer: PeerDescriptor, outbox: &mut Outbox) {
        if peer.node_id() == self.local.node_id() {
            return;
        }

        let new = !self.routing_table.contains(peer.node_id());

        if !self.routing_table.add(peer.clone()) {
            return;
        }

        if self.connections.connection(peer.node_id()).is_none() {
            self.connections.connect(&peer, outbox);
        }

        if new {
            trace!(contact = ?peer.node_id(), "New contact");

            self.store_manager.on_new_contact(
                &peer,
                &self.local,
                &self.routing_table,
                &self.local_store,
                outbox,
            );
        }
    }

    fn remove_contact(&mut self, node_id: &NodeId) {
        if self.routing_table.remove(node_id) {
            debug!(contact = ?node_id, "Removed unresponsive contact");
        }

        self.connections.disconnect(node_id);
    }

    /// Borrow the router and finder next to the io the router works through.
    fn split<'a>(&'a mut self, outbox: &'a mut Outbox) -> (&'a mut Router, &'a mut Finder, NodeIo<'a>) {
        let io = NodeIo {
            local: &self.local,
            connections: &self.connections,
            outbox,
            delivered: &mut self.delivered,
        };

        (&mut self.router, &mut self.finder, io)
    }
}

/// The [RouterIo] of a node, borrowing the parts of [NodeState] the router
/// does not own.
pub(crate) struct NodeIo<'a> {
    local: &'a PeerDescriptor,
    connections: &'a ConnectionManager,
    outbox: &'a mut Outbox,
    delivered: &'a mut Vec<Message>,
}

impl RouterIo for NodeIo<'_> {
    fn local_peer_descriptor(&self) -> &PeerDescriptor {
        self.local
    }

    fn connections(&self) -> Vec<PeerDescriptor> {
        self.connections.connected_peers()
    }

    fn send(
        &mut self,
        mode: RoutingMode,
        to: &PeerDescriptor,
        wrapper: &RouteMessageWrapper,
    ) -> RequestId {
        self.outbox.call(mode.method(), wrapper, to)
    }

    fn deliver(&mut self, message: Message) {
        self.delivered.push(message);
    }
}

#[derive(Debug, Default)]
/// What settled during a single [Actor::tick].
pub struct TickReport {
    /// Lookups started with [Actor::find_closest_nodes], [Actor::find_data] or
    /// [Actor::find_recursively].
    pub done_lookups: Vec<(RequestId, Result<RecursiveOperationResult, LookupError>)>,
    /// Operations started with [Actor::store_data] or [Actor::delete_data].
    pub done_stores: Vec<(RequestId, Result<Vec<PeerDescriptor>, StoreError>)>,
    /// Pings and whether the peer answered.
    pub done_pings: Vec<(RequestId, bool)>,
    /// Set once the bootstrapping lookup is done.
    pub bootstrapped: Option<bool>,
    /// Routed messages addressed to this node's application.
    pub messages: Vec<Message>,
}

#[derive(Debug)]
/// Internal Actor called in the Dht thread loop, useful to create your own actor setup.
pub struct Actor {
    rpc: RpcCommunicator<NodeState>,
    state: NodeState,
    outbox: Outbox,
    local_port: Option<u16>,

    pings: HashSet<RequestId>,
    bootstrap: Option<RequestId>,
    bootstrapped: Option<bool>,

    last_sweep: Instant,
}

impl Actor {
    /// Creates a new Actor, binding a UDP socket unless a transport was configured.
    ///
    /// Starts bootstrapping from the configured entry points, progress is
    /// made in [Actor::tick].
    pub fn new(config: Config) -> Result<Self> {
        let transport: Box<dyn Transport> = match config.transport {
            Some(transport) => transport,
            None => Box::new(UdpTransport::bind(config.port)?),
        };

        let local_port = transport.local_port();

        let local = config.peer_descriptor.unwrap_or_else(|| {
            PeerDescriptor::random().with_websocket(ConnectivityMethod::new(
                config.host.as_str(),
                local_port.or(config.port).unwrap_or(DEFAULT_PORT),
                false,
            ))
        });

        let mut rpc = RpcCommunicator::new(
            local.clone(),
            config.service_id,
            transport,
            config.rpc_request_timeout,
        );
        handle_request::register_rpc_methods(&mut rpc)?;

        let state = NodeState {
            routing_table: RoutingTable::new(*local.node_id()),
            connections: ConnectionManager::new(local.clone(), config.rpc_request_timeout),
            router: Router::new(DuplicateDetector::new(
                config.duplicate_detector_capacity,
                config.duplicate_detector_retention,
            )),
            finder: Finder::new(
                config.lookup_parallelism,
                config.lookup_timeout,
                config.max_lookup_rounds,
            ),
            store_manager: StoreManager::new(
                config.store_max_ttl,
                config.store_highest_ttl,
                config.store_number_of_copies,
            ),
            local_store: LocalDataStore::new(),
            delivered: Vec::new(),
            local,
        };

        info!(id = ?state.local.node_id(), ?local_port, "Overlay node listening");

        let mut actor = Actor {
            rpc,
            state,
            outbox: Outbox::new(),
            local_port,
            pings: HashSet::new(),
            bootstrap: None,
            bootstrapped: None,
            last_sweep: Instant::now(),
        };

        // Entry points only seed the lookup of our own id, later lookups start
        // from the routing table and fall back to this node alone.
        if config.entry_points.is_empty() {
            actor.bootstrapped = Some(true);
        } else {
            let id = *actor.id();
            actor.bootstrap = Some(actor.state.finder.execute(
                id,
                RecursiveOperation::FindClosestNodes,
                &actor.state.local,
                config.entry_points,
                vec![],
                &mut actor.outbox,
            ));
        }

        Ok(actor)
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &NodeId {
        self.state.local.node_id()
    }

    pub fn local_peer_descriptor(&self) -> &PeerDescriptor {
        &self.state.local
    }

    /// Returns the port the transport listens on, if any.
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.state.routing_table
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.state.connections
    }

    pub fn local_store(&self) -> &LocalDataStore {
        &self.state.local_store
    }

    /// Returns `None` while the bootstrapping lookup is running, then whether
    /// it found any peer.
    pub fn bootstrapped(&self) -> Option<bool> {
        self.bootstrapped
    }

    /// Returns a thread safe and lightweight summary of this node's
    /// information and statistics.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Advance every ongoing operation by one step, handling at most one
    /// incoming message.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if let Some(message) = self.rpc.recv() {
            if let Some(response) =
                self.rpc
                    .handle_incoming_message(&mut self.state, message, &mut self.outbox)
            {
                self.handle_response(response, &mut report);
            }
        }

        for failure in self.rpc.take_failures() {
            self.handle_response(failure, &mut report);
        }

        self.state.finder.tick(&mut self.outbox);
        self.state.connections.tick();
        self.state.router.tick();

        if self.last_sweep.elapsed() >= STORE_SWEEP_INTERVAL {
            let removed = self.state.local_store.remove_expired();
            if removed > 0 {
                trace!(removed, "Swept expired entries");
            }

            self.last_sweep = Instant::now();
        }

        self.handle_done_lookups(&mut report);

        for event in self.state.connections.take_events() {
            match event {
                ConnectionEvent::Connected(peer) => {
                    trace!(peer = ?peer.node_id(), "Connection open");
                }
                ConnectionEvent::Disconnected(peer) => {
                    trace!(peer = ?peer.node_id(), "Connection closed");
                }
            }
        }

        self.handle_delivered(&mut report);

        self.rpc.flush(&mut self.outbox);

        report
    }

    /// Ping a peer, the outcome is reported in [TickReport::done_pings].
    pub fn ping(&mut self, target: &PeerDescriptor) -> RequestId {
        let request_id = self.outbox.call(
            methods::PING,
            &PingRequest {
                request_id: RequestId::random(),
            },
            target,
        );

        self.pings.insert(request_id);

        request_id
    }

    /// Start an iterative lookup of the peers closest to `target`.
    pub fn find_closest_nodes(&mut self, target: NodeId) -> RequestId {
        self.execute(target, RecursiveOperation::FindClosestNodes)
    }

    /// Start an iterative lookup of the entries stored under `key`.
    pub fn find_data(&mut self, key: NodeId) -> RequestId {
        self.execute(key, RecursiveOperation::FindData)
    }

    /// Start a lookup routed hop by hop through open connections.
    pub fn find_recursively(&mut self, target: NodeId, operation: RecursiveOperation) -> RequestId {
        let local_entries = self.state.local_store.entries_for(&target);

        let (router, finder, mut io) = self.state.split(&mut self.outbox);

        finder.find_recursively(target, operation, local_entries, router, &mut io)
    }

    /// Store `data` under `key` on the closest peers.
    ///
    /// The ttl defaults to, and is capped by, the configured highest ttl.
    pub fn store_data(&mut self, key: NodeId, data: Bytes, ttl: Option<Duration>) -> RequestId {
        let lookup_id = self.execute(key, RecursiveOperation::StoreData);

        self.state
            .store_manager
            .store_data(lookup_id, &self.state.local, key, data, ttl);

        lookup_id
    }

    /// Tombstone this node's entry under `key` on the closest peers.
    pub fn delete_data(&mut self, key: NodeId) -> RequestId {
        let lookup_id = self.execute(key, RecursiveOperation::StoreData);

        self.state.store_manager.delete_data(lookup_id, key);

        lookup_id
    }

    /// Live entries this node stores under `key`, tombstones included.
    pub fn local_entries(&self, key: &NodeId) -> Vec<DataEntry> {
        self.state.local_store.entries_for(key)
    }

    /// Route an application message toward `message.target`.
    pub fn send(&mut self, message: Message) -> RouteMessageAck {
        let (router, _, mut io) = self.state.split(&mut self.outbox);

        router.send(message, &mut io)
    }

    /// Hand the stored entries over to the closest contacts and stop routing.
    /// Requests still in flight are left to time out.
    pub fn shutdown(&mut self) {
        debug!(id = ?self.id(), "Shutting down");

        self.state.store_manager.hand_over_entries(
            &self.state.routing_table,
            &self.state.local_store,
            &mut self.outbox,
        );
        self.state.router.stop();

        self.rpc.flush(&mut self.outbox);
    }

    // === Private Methods ===

    fn execute(&mut self, target: NodeId, operation: RecursiveOperation) -> RequestId {
        let seeds = self.state.routing_table.closest(&target);
        let local_entries = self.state.local_store.entries_for(&target);

        self.state.finder.execute(
            target,
            operation,
            &self.state.local,
            seeds,
            local_entries,
            &mut self.outbox,
        )
    }

    fn handle_done_lookups(&mut self, report: &mut TickReport) {
        for (id, result) in self.state.finder.take_completed() {
            if self.state.store_manager.is_awaiting_lookup(&id) {
                self.state.store_manager.on_lookup_done(
                    id,
                    result,
                    &self.state.local,
                    &mut self.state.local_store,
                    &mut self.outbox,
                );
            } else if self.bootstrap == Some(id) {
                let success = result.is_ok() && !self.state.routing_table.is_empty();

                info!(
                    id = ?self.id(),
                    contacts = self.state.routing_table.size(),
                    success,
                    "Bootstrapping done"
                );

                self.bootstrap = None;
                self.bootstrapped = Some(success);
                report.bootstrapped = Some(success);
            } else {
                report.done_lookups.push((id, result));
            }
        }

        report
            .done_stores
            .extend(self.state.store_manager.take_completed());
    }

    /// RPC carried over the overlay goes back to the communicator, anything
    /// else routed to us belongs to the application.
    fn handle_delivered(&mut self, report: &mut TickReport) {
        for message in std::mem::take(&mut self.state.delivered) {
            match &message.body {
                MessageBody::Rpc(_) if message.service_id == self.rpc.service_id() => {
                    if let Some(response) = self.rpc.handle_incoming_message(
                        &mut self.state,
                        message,
                        &mut self.outbox,
                    ) {
                        self.handle_response(response, report);
                    }
                }
                MessageBody::Rpc(_) => report.messages.push(message),
                MessageBody::FindRequest(_) | MessageBody::RecursiveOperationRequest(_) => {
                    debug!(from = ?message.source.node_id(), "Ignoring find request routed to us");
                }
            }
        }
    }
}
