//! Dht node.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, trace};

use crate::actor::{Actor, Config, Info, TickReport};
use crate::common::{
    ConnectivityMethod, DataEntry, Message, NodeId, NodeType, PeerDescriptor, RecursiveOperation,
    RequestId, RouteMessageAck,
};
use crate::finder::{LookupError, RecursiveOperationResult};
use crate::store::StoreError;
use crate::transport::{Simulator, Transport, DEFAULT_PORT};
use crate::Result;

/// Routed application messages buffered before new ones are dropped.
const MESSAGES_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
/// Overlay DHT node.
pub struct Dht {
    sender: Sender<ActorMessage>,
    messages: Receiver<Message>,
}

impl Dht {
    /// Create a new Dht node.
    ///
    /// Could return an error if it failed to bind to the specified
    /// port or other io errors while binding the udp socket.
    pub fn new(config: Config) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();
        let (messages_sender, messages) = flume::bounded(MESSAGES_CHANNEL_CAPACITY);
        let (ready_sender, ready) = flume::bounded::<Result<()>>(1);

        thread::Builder::new()
            .name("overlay-dht".to_string())
            .spawn(move || run(config, receiver, messages_sender, ready_sender))?;

        ready.recv().map_err(|_| DhtWasShutdown)??;

        Ok(Dht { sender, messages })
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send_actor_message(ActorMessage::Info(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Wait until the bootstrapping lookup is done.
    ///
    /// Returns true if the bootstrapping was successful, or if there was
    /// nothing to bootstrap from.
    pub fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.send_actor_message(ActorMessage::Bootstrapped(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Routed messages addressed to this node by other applications.
    pub fn messages(&self) -> Receiver<Message> {
        self.messages.clone()
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.sender.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Returns true if `peer` answered a ping before the rpc deadline.
    pub fn ping(&self, peer: &PeerDescriptor) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.send_actor_message(ActorMessage::Ping(peer.clone(), sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Lookups ===

    /// Find the peers closest to `target`, closest first.
    pub fn find_closest_nodes(&self, target: NodeId) -> Result<Vec<PeerDescriptor>, DhtLookupError> {
        Ok(self
            .lookup(target, RecursiveOperation::FindClosestNodes, false)?
            .closest_nodes)
    }

    /// Find the entries stored under `key`, one per creator.
    ///
    /// Tombstones are included, see [DataEntry::deleted].
    pub fn find_data(&self, key: NodeId) -> Result<Vec<DataEntry>, DhtLookupError> {
        Ok(self
            .lookup(key, RecursiveOperation::FindData, false)?
            .data_entries)
    }

    /// Run `operation` routed hop by hop through open connections, every hop
    /// reporting back to this node.
    pub fn find_recursively(
        &self,
        target: NodeId,
        operation: RecursiveOperation,
    ) -> Result<RecursiveOperationResult, DhtLookupError> {
        self.lookup(target, operation, true)
    }

    // === Data ===

    /// Store `data` under `key` on the closest peers, returning the peers
    /// that accepted it, closest to the key first.
    ///
    /// The `ttl` defaults to, and is capped by, [Config::store_highest_ttl].
    pub fn store_data(
        &self,
        key: NodeId,
        data: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<Vec<PeerDescriptor>, DhtStoreError> {
        let (sender, receiver) = flume::bounded(1);

        self.send_actor_message(ActorMessage::Store(key, data.into(), ttl, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    /// Tombstone the entry this node stored under `key` on the closest
    /// peers, returning the peers that held it.
    pub fn delete_data(&self, key: NodeId) -> Result<Vec<PeerDescriptor>, DhtStoreError> {
        let (sender, receiver) = flume::bounded(1);

        self.send_actor_message(ActorMessage::Delete(key, sender))?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    /// Entries this node stores under `key`, tombstones included.
    pub fn local_entries(&self, key: NodeId) -> Result<Vec<DataEntry>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<DataEntry>>(1);

        self.send_actor_message(ActorMessage::LocalEntries(key, sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Routing ===

    /// Route `message` to the peer in its `target`.
    ///
    /// The returned ack only tells whether the message left this node.
    pub fn send(&self, message: Message) -> Result<RouteMessageAck, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<RouteMessageAck>(1);

        self.send_actor_message(ActorMessage::Send(message, sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Private Methods ===

    fn lookup(
        &self,
        target: NodeId,
        operation: RecursiveOperation,
        recursive: bool,
    ) -> Result<RecursiveOperationResult, DhtLookupError> {
        let (sender, receiver) = flume::bounded(1);

        self.send_actor_message(ActorMessage::Lookup {
            target,
            operation,
            recursive,
            sender,
        })?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    pub(crate) fn send_actor_message(&self, message: ActorMessage) -> Result<(), DhtWasShutdown> {
        self.sender.send(message).map_err(|_| DhtWasShutdown)
    }
}

fn run(
    config: Config,
    receiver: Receiver<ActorMessage>,
    messages: Sender<Message>,
    ready: Sender<Result<()>>,
) {
    let mut actor = match Actor::new(config) {
        Ok(actor) => {
            let _ = ready.send(Ok(()));
            actor
        }
        Err(error) => {
            let _ = ready.send(Err(error));
            return;
        }
    };

    let mut senders = Senders::default();

    loop {
        match receiver.try_recv() {
            Ok(ActorMessage::Shutdown(sender)) => {
                actor.shutdown();

                let _ = sender.send(());
                break;
            }
            Ok(message) => senders.handle_actor_message(&mut actor, message),
            Err(TryRecvError::Disconnected) => {
                // Node was dropped, kill this thread.
                debug!("overlay_dht::Dht's actor thread was shutdown after Drop.");
                break;
            }
            Err(TryRecvError::Empty) => {
                // No op
            }
        }

        let report = actor.tick();

        senders.handle_report(report, &messages);
    }
}

#[derive(Debug, Default)]
/// Callers waiting for the actor, keyed by the [RequestId] of their operation.
struct Senders {
    lookups: HashMap<RequestId, LookupSender>,
    stores: HashMap<RequestId, StoreSender>,
    pings: HashMap<RequestId, Sender<bool>>,
    bootstrapped: Vec<Sender<bool>>,
}

impl Senders {
    fn handle_actor_message(&mut self, actor: &mut Actor, message: ActorMessage) {
        match message {
            ActorMessage::Info(sender) => {
                let _ = sender.send(actor.info());
            }
            ActorMessage::Bootstrapped(sender) => match actor.bootstrapped() {
                Some(bootstrapped) => {
                    let _ = sender.send(bootstrapped);
                }
                None => self.bootstrapped.push(sender),
            },
            ActorMessage::Ping(peer, sender) => {
                self.pings.insert(actor.ping(&peer), sender);
            }
            ActorMessage::Lookup {
                target,
                operation,
                recursive,
                sender,
            } => {
                let id = match (recursive, operation) {
                    (true, operation) => actor.find_recursively(target, operation),
                    (false, RecursiveOperation::FindData) => actor.find_data(target),
                    (false, _) => actor.find_closest_nodes(target),
                };

                self.lookups.insert(id, sender);
            }
            ActorMessage::Store(key, data, ttl, sender) => {
                self.stores.insert(actor.store_data(key, data, ttl), sender);
            }
            ActorMessage::Delete(key, sender) => {
                self.stores.insert(actor.delete_data(key), sender);
            }
            ActorMessage::LocalEntries(key, sender) => {
                let _ = sender.send(actor.local_entries(&key));
            }
            ActorMessage::Send(message, sender) => {
                let _ = sender.send(actor.send(message));
            }
            ActorMessage::Shutdown(sender) => {
                let _ = sender.send(());
            }
        }
    }

    fn handle_report(&mut self, report: TickReport, messages: &Sender<Message>) {
        if let Some(bootstrapped) = report.bootstrapped {
            for sender in self.bootstrapped.drain(..) {
                let _ = sender.send(bootstrapped);
            }
        }

        for (id, result) in report.done_lookups {
            if let Some(sender) = self.lookups.remove(&id) {
                let _ = sender.send(result);
            }
        }

        for (id, result) in report.done_stores {
            if let Some(sender) = self.stores.remove(&id) {
                let _ = sender.send(result);
            }
        }

        for (id, answered) in report.done_pings {
            if let Some(sender) = self.pings.remove(&id) {
                let _ = sender.send(answered);
            }
        }

        for message in report.messages {
            if messages.try_send(message).is_err() {
                trace!("Application is not reading messages, dropping one");
            }
        }
    }
}

type LookupSender = Sender<Result<RecursiveOperationResult, LookupError>>;
type StoreSender = Sender<Result<Vec<PeerDescriptor>, StoreError>>;

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    Bootstrapped(Sender<bool>),
    Ping(PeerDescriptor, Sender<bool>),
    Lookup {
        target: NodeId,
        operation: RecursiveOperation,
        recursive: bool,
        sender: LookupSender,
    },
    Store(NodeId, Bytes, Option<Duration>, StoreSender),
    Delete(NodeId, StoreSender),
    LocalEntries(NodeId, Sender<Vec<DataEntry>>),
    Send(Message, Sender<RouteMessageAck>),
    Shutdown(Sender<()>),
}

#[derive(Debug, Default)]
/// Dht builder
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set this node's own descriptor, instead of a random Id advertising the bound port.
    pub fn peer_descriptor(mut self, peer_descriptor: PeerDescriptor) -> Self {
        self.0.peer_descriptor = Some(peer_descriptor);

        self
    }

    /// Set the host advertised with a random Id.
    pub fn host(mut self, host: &str) -> Self {
        self.0.host = host.to_string();

        self
    }

    /// Set the UDP port to listen on.
    pub fn port(mut self, port: u16) -> Self {
        self.0.port = Some(port);

        self
    }

    /// Set the peers to bootstrap from.
    pub fn entry_points(mut self, entry_points: &[PeerDescriptor]) -> Self {
        self.0.entry_points = entry_points.to_vec();

        self
    }

    /// Set the service id of DHT messages.
    pub fn service_id(mut self, service_id: &str) -> Self {
        self.0.service_id = service_id.to_string();

        self
    }

    /// Use `transport` instead of binding a UDP socket.
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.0.transport = Some(transport);

        self
    }

    /// Set the deadline of a single rpc request.
    pub fn rpc_request_timeout(mut self, timeout: Duration) -> Self {
        self.0.rpc_request_timeout = timeout;

        self
    }

    /// Set the highest ttl accepted for entries stored on behalf of other peers.
    pub fn store_max_ttl(mut self, ttl: Duration) -> Self {
        self.0.store_max_ttl = ttl;

        self
    }

    /// Set the highest, and default, ttl of entries created by this node.
    pub fn store_highest_ttl(mut self, ttl: Duration) -> Self {
        self.0.store_highest_ttl = ttl;

        self
    }

    /// Set the number of peers an entry is stored on.
    pub fn store_number_of_copies(mut self, copies: usize) -> Self {
        self.0.store_number_of_copies = copies;

        self
    }

    /// Set the number of peers queried in parallel in each lookup round.
    pub fn lookup_parallelism(mut self, parallelism: usize) -> Self {
        self.0.lookup_parallelism = parallelism;

        self
    }

    /// Set the deadline of a whole lookup.
    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.0.lookup_timeout = timeout;

        self
    }

    /// Set the budget of sequential rounds per lookup.
    pub fn max_lookup_rounds(mut self, rounds: usize) -> Self {
        self.0.max_lookup_rounds = rounds;

        self
    }

    /// Set how many routing attempts are remembered, and for how long.
    pub fn duplicate_detector(mut self, capacity: usize, retention: Duration) -> Self {
        self.0.duplicate_detector_capacity = capacity;
        self.0.duplicate_detector_retention = retention;

        self
    }

    /// Create a Dht node.
    pub fn build(self) -> Result<Dht> {
        Dht::new(self.0)
    }
}

/// Create a testnet of Dht nodes connected through an in-process [Simulator].
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<PeerDescriptor>,
    pub nodes: Vec<Dht>,
    simulator: Simulator,
}

impl Testnet {
    /// Start `count` nodes, the first one serving as the entry point of the others.
    ///
    /// Returns once every node is bootstrapped.
    pub fn new(count: usize) -> Result<Testnet> {
        let mut testnet = Testnet {
            bootstrap: vec![],
            nodes: vec![],
            simulator: Simulator::new(),
        };

        for _ in 0..count {
            let peer = Testnet::peer_descriptor(NodeId::random());

            let dht = testnet.builder(peer.clone()).build()?;
            dht.bootstrapped()?;

            if testnet.bootstrap.is_empty() {
                testnet.bootstrap.push(peer);
            }

            testnet.nodes.push(dht);
        }

        Ok(testnet)
    }

    /// A builder for a node joining this testnet as `peer`.
    pub fn builder(&self, peer: PeerDescriptor) -> DhtBuilder {
        Dht::builder()
            .transport(Box::new(self.simulator.transport(&peer)))
            .peer_descriptor(peer)
            .entry_points(&self.bootstrap)
    }

    /// A native descriptor with a plain listener, so testnet nodes can connect to each other.
    pub fn peer_descriptor(node_id: NodeId) -> PeerDescriptor {
        PeerDescriptor::new(node_id, NodeType::Native).with_websocket(ConnectivityMethod::new(
            "127.0.0.1",
            DEFAULT_PORT,
            false,
        ))
    }

    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The Dht was shutdown")]
/// The actor thread of the [Dht] is no longer running.
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Dht lookup errors
pub enum DhtLookupError {
    #[error(transparent)]
    LookupError(#[from] LookupError),

    #[error(transparent)]
    Shutdown(#[from] DhtWasShutdown),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Dht store and delete errors
pub enum DhtStoreError {
    #[error(transparent)]
    StoreError(#[from] StoreError),

    #[error(transparent)]
    Shutdown(#[from] DhtWasShutdown),
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use crate::common::{MessageBody, RpcMessage, RpcPayload};

    use super::*;

    #[test]
    fn shutdown() {
        let testnet = Testnet::new(1).unwrap();

        let mut a = testnet.nodes[0].clone();
        let b = a.clone();

        a.shutdown();

        assert_eq!(b.info().map(|_| ()), Err(DhtWasShutdown));
        assert_eq!(
            b.find_closest_nodes(NodeId::random()),
            Err(DhtLookupError::Shutdown(DhtWasShutdown))
        );
    }

    #[test]
    fn bind_twice() {
        let a = Dht::builder().port(0).build().unwrap();
        let port = a.info().unwrap().local_port().unwrap();

        let result = Dht::builder().port(port).build();

        assert!(result.is_err());
    }

    #[test]
    fn lonely_node() {
        let testnet = Testnet::new(1).unwrap();
        let node = &testnet.nodes[0];

        assert!(node.bootstrapped().unwrap());

        let info = node.info().unwrap();
        assert_eq!(info.routing_table_size(), 0);
        assert_eq!(info.local_port(), None);

        let closest = node.find_closest_nodes(NodeId::random()).unwrap();
        assert_eq!(closest, vec![testnet.bootstrap[0].clone()]);
    }

    #[test]
    fn bootstrap_and_find() {
        let testnet = Testnet::new(5).unwrap();

        let dht = testnet
            .builder(Testnet::peer_descriptor(NodeId::random()))
            .build()
            .unwrap();

        assert!(dht.bootstrapped().unwrap());

        let info = dht.info().unwrap();
        assert!(info.routing_table_size() > 0);

        let closest = dht.find_closest_nodes(NodeId::random()).unwrap();
        assert!(closest.len() > 1);
        assert!(closest.contains(&testnet.bootstrap[0]));
    }

    #[test]
    fn ping() {
        let testnet = Testnet::new(2).unwrap();

        let a = &testnet.nodes[1];

        assert!(a.ping(&testnet.bootstrap[0]).unwrap());
        assert!(!a
            .ping(&Testnet::peer_descriptor(NodeId::random()))
            .unwrap());
    }

    #[test]
    fn send_and_receive() {
        let testnet = Testnet::new(3).unwrap();

        let a = &testnet.nodes[1];
        let b = &testnet.nodes[2];

        let target = b.info().unwrap().peer_descriptor().clone();
        let source = a.info().unwrap().peer_descriptor().clone();

        let message = Message::new(
            "chat",
            source,
            Some(target),
            MessageBody::Rpc(RpcMessage {
                request_id: RequestId::random(),
                method: "say".to_string(),
                payload: RpcPayload::Request(Bytes::from_static(b"hello")),
            }),
        );

        let messages = b.messages();

        // Connections open shortly after bootstrapping.
        let deadline = Instant::now() + Duration::from_secs(5);
        let received = loop {
            let _ = a.send(message.clone()).unwrap();

            if let Ok(received) = messages.recv_timeout(Duration::from_millis(200)) {
                break received;
            }

            assert!(Instant::now() < deadline, "message never arrived");
        };

        assert_eq!(received.message_id, message.message_id);
    }
}
