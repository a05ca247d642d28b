//! Duplicate-suppressing delivery of [Message]s across the overlay.
//!
//! A wrapper either reaches this node's consumers, because this node is its
//! target, or continues to the connected peers closest to the target.

mod duplicate_detector;
mod session;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{
    is_closer, methods, ClosestPeers, Message, NodeId, PeerDescriptor, RequestId,
    RouteMessageAck, RouteMessageError, RouteMessageWrapper,
};
use crate::rpc::RpcError;

pub use duplicate_detector::{
    DuplicateDetector, DEFAULT_DUPLICATE_DETECTOR_CAPACITY, DEFAULT_DUPLICATE_DETECTOR_RETENTION,
};
pub use session::MAX_FAILED_HOPS;

use session::RoutingSession;

/// How long a routing session waits for its hops before being dropped.
pub const ROUTING_SESSION_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a `reachable_through` hint is used to reach its source.
pub const FORWARDING_ENTRY_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// Deliver to the peer whose id is the target.
    Route,
    /// Deliver to a relay, which routes the inner message on.
    Forward,
    /// A find request reporting back to its origin at every hop.
    Recursive,
}

impl RoutingMode {
    /// RPC method carrying wrappers of this mode.
    pub fn method(&self) -> &'static str {
        match self {
            RoutingMode::Route => methods::ROUTE_MESSAGE,
            RoutingMode::Forward => methods::FORWARD_MESSAGE,
            RoutingMode::Recursive => methods::FIND_RECURSIVELY,
        }
    }
}

/// What the router needs from the node hosting it.
pub trait RouterIo {
    fn local_peer_descriptor(&self) -> &PeerDescriptor;

    /// Peers with an open connection.
    fn connections(&self) -> Vec<PeerDescriptor>;

    /// Send `wrapper` to `to` through the RPC of `mode`.
    fn send(
        &mut self,
        mode: RoutingMode,
        to: &PeerDescriptor,
        wrapper: &RouteMessageWrapper,
    ) -> RequestId;

    /// Hand a message addressed to this node to its local consumers.
    fn deliver(&mut self, message: Message);
}

/// The routing capability other components depend on.
pub trait Routing {
    /// Handle a wrapper sent to us by its previous hop.
    fn route_message(
        &mut self,
        wrapper: RouteMessageWrapper,
        io: &mut dyn RouterIo,
    ) -> RouteMessageAck;

    /// Handle a wrapper for which this node is a relay.
    fn forward_message(
        &mut self,
        wrapper: RouteMessageWrapper,
        io: &mut dyn RouterIo,
    ) -> RouteMessageAck;

    /// Deliver locally or pass on to the closest connections, without duplicate checks.
    fn do_route_message(
        &mut self,
        wrapper: RouteMessageWrapper,
        mode: RoutingMode,
        io: &mut dyn RouterIo,
    ) -> RouteMessageAck;

    fn add_to_duplicate_detector(&mut self, request_id: RequestId);

    fn is_most_likely_duplicate(&self, request_id: &RequestId) -> bool;
}

#[derive(Debug)]
struct ForwardingEntry {
    peers: Vec<PeerDescriptor>,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct Router {
    duplicate_detector: DuplicateDetector,
    forwarding_table: HashMap<NodeId, ForwardingEntry>,
    sessions: HashMap<RequestId, RoutingSession>,
    messages_routed: usize,
    stopped: bool,
}

impl Router {
    pub fn new(duplicate_detector: DuplicateDetector) -> Self {
        Self {
            duplicate_detector,
            forwarding_table: HashMap::new(),
            sessions: HashMap::new(),
            messages_routed: 0,
            stopped: false,
        }
    }

    // === Getters ===

    /// Number of wrappers this router accepted to pass on.
    pub fn messages_routed(&self) -> usize {
        self.messages_routed
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if `request_id` is a hop of one of our routing sessions.
    pub fn owns(&self, request_id: &RequestId) -> bool {
        self.sessions
            .values()
            .any(|session| session.is_inflight(request_id))
    }

    // === Public Methods ===

    /// Originate a routed message toward `message.target`.
    pub fn send(&mut self, message: Message, io: &mut dyn RouterIo) -> RouteMessageAck {
        let request_id = RequestId::random();

        let Some(target) = message.target.as_ref().map(|peer| *peer.node_id()) else {
            debug!(?request_id, "Cannot route a message without a target");
            return RouteMessageAck::error(request_id, RouteMessageError::NoTargets);
        };

        let mut wrapper = RouteMessageWrapper {
            message,
            request_id,
            source_peer: io.local_peer_descriptor().clone(),
            target,
            routing_path: vec![],
            reachable_through: vec![],
        };

        self.add_to_duplicate_detector(request_id);

        let relay = self
            .forwarding_table
            .get(&target)
            .filter(|entry| entry.expires_at > Instant::now())
            .and_then(|entry| entry.peers.first())
            .map(|peer| *peer.node_id());

        match relay {
            Some(relay) => {
                trace!(?target, ?relay, "Forwarding through a known relay");
                wrapper.target = relay;
                self.do_route_message(wrapper, RoutingMode::Forward, io)
            }
            None => self.do_route_message(wrapper, RoutingMode::Route, io),
        }
    }

    /// Originate a recursive operation request toward `target`.
    pub fn send_recursive(
        &mut self,
        message: Message,
        target: NodeId,
        io: &mut dyn RouterIo,
    ) -> RouteMessageAck {
        let request_id = RequestId::random();

        let wrapper = RouteMessageWrapper {
            message,
            request_id,
            source_peer: io.local_peer_descriptor().clone(),
            target,
            routing_path: vec![],
            reachable_through: vec![],
        };

        self.add_to_duplicate_detector(request_id);

        self.do_route_message(wrapper, RoutingMode::Recursive, io)
    }

    /// Settle a hop of one of our sessions. Returns false if no session owns it.
    pub fn on_response(
        &mut self,
        request_id: &RequestId,
        result: Result<RouteMessageAck, RpcError>,
        io: &mut dyn RouterIo,
    ) -> bool {
        let Some((session_id, session)) = self
            .sessions
            .iter_mut()
            .find(|(_, session)| session.is_inflight(request_id))
        else {
            return false;
        };

        let succeeded = match &result {
            Ok(ack) => ack.is_ok(),
            Err(_) => false,
        };

        if !succeeded {
            trace!(?request_id, ?result, "Routing hop failed");
        }

        if let Some(success) = session.on_response(request_id, succeeded, io) {
            debug!(request_id = ?session_id, success, "Routing session done");

            let session_id = *session_id;
            self.sessions.remove(&session_id);
        }

        true
    }

    /// Drop expired sessions and forwarding hints.
    pub fn tick(&mut self) {
        let now = Instant::now();

        self.sessions.retain(|_, session| {
            let alive = now.duration_since(session.started_at) < ROUTING_SESSION_TIMEOUT;

            if !alive {
                debug!(request_id = ?session.request_id(), "Routing session timed out");
            }

            alive
        });

        self.forwarding_table
            .retain(|_, entry| entry.expires_at > now);
    }

    /// Stop routing, every later request is answered with [RouteMessageError::Stopped].
    pub fn stop(&mut self) {
        self.stopped = true;
        self.sessions.clear();
        self.forwarding_table.clear();
    }

    // === Private Methods ===

    fn deliver_locally(&mut self, wrapper: RouteMessageWrapper, io: &mut dyn RouterIo) {
        let local = *io.local_peer_descriptor().node_id();

        if !wrapper.reachable_through.is_empty() && wrapper.source_peer.node_id() != &local {
            self.forwarding_table.insert(
                *wrapper.source_peer.node_id(),
                ForwardingEntry {
                    peers: wrapper.reachable_through,
                    expires_at: Instant::now() + FORWARDING_ENTRY_TTL,
                },
            );
        }

        trace!(request_id = ?wrapper.request_id, from = ?wrapper.source_peer.node_id(), "Delivering routed message");

        io.deliver(wrapper.message);
    }

    fn reject_duplicate(&mut self, request_id: RequestId) -> Option<RouteMessageAck> {
        if self.stopped {
            return Some(RouteMessageAck::error(request_id, RouteMessageError::Stopped));
        }

        if self.is_most_likely_duplicate(&request_id) {
            trace!(?request_id, "Duplicate routing request");
            return Some(RouteMessageAck::error(request_id, RouteMessageError::Duplicate));
        }

        self.add_to_duplicate_detector(request_id);

        None
    }
}

impl Routing for Router {
    fn route_message(
        &mut self,
        wrapper: RouteMessageWrapper,
        io: &mut dyn RouterIo,
    ) -> RouteMessageAck {
        if let Some(ack) = self.reject_duplicate(wrapper.request_id) {
            return ack;
        }

        self.do_route_message(wrapper, RoutingMode::Route, io)
    }

    fn forward_message(
        &mut self,
        mut wrapper: RouteMessageWrapper,
        io: &mut dyn RouterIo,
    ) -> RouteMessageAck {
        if let Some(ack) = self.reject_duplicate(wrapper.request_id) {
            return ack;
        }

        let local = *io.local_peer_descriptor().node_id();

        if wrapper.target != local {
            return self.do_route_message(wrapper, RoutingMode::Forward, io);
        }

        // We are the relay, route the inner message to its final target.
        match wrapper.message.target.as_ref().map(|peer| *peer.node_id()) {
            Some(target) if target != local => {
                wrapper.target = target;
                self.do_route_message(wrapper, RoutingMode::Route, io)
            }
            _ => {
                let request_id = wrapper.request_id;
                self.deliver_locally(wrapper, io);
                RouteMessageAck::ok(request_id)
            }
        }
    }

    fn do_route_message(
        &mut self,
        mut wrapper: RouteMessageWrapper,
        mode: RoutingMode,
        io: &mut dyn RouterIo,
    ) -> RouteMessageAck {
        let request_id = wrapper.request_id;

        if self.stopped {
            return RouteMessageAck::error(request_id, RouteMessageError::Stopped);
        }

        let local = io.local_peer_descriptor().clone();

        if wrapper.target == *local.node_id() {
            self.deliver_locally(wrapper, io);
            return RouteMessageAck::ok(request_id);
        }

        let mut excluded: HashSet<NodeId> = wrapper
            .routing_path
            .iter()
            .map(|peer| *peer.node_id())
            .collect();
        excluded.insert(*wrapper.source_peer.node_id());
        excluded.insert(*local.node_id());

        let previous = wrapper.routing_path.last().map(|peer| *peer.node_id());

        let mut candidates = ClosestPeers::new(wrapper.target);

        for peer in io.connections() {
            if excluded.contains(peer.node_id()) {
                continue;
            }

            if let Some(previous) = &previous {
                if !is_closer(peer.node_id(), &wrapper.target, previous) {
                    continue;
                }
            }

            candidates.add(peer);
        }

        if candidates.is_empty() {
            trace!(?request_id, target = ?wrapper.target, "No targets to route to");
            return RouteMessageAck::error(request_id, RouteMessageError::NoTargets);
        }

        let parallelism = if wrapper.source_peer == local { 2 } else { 1 };

        wrapper.routing_path.push(local);

        let mut session =
            RoutingSession::new(wrapper, mode, candidates.into_iter().collect(), parallelism);
        session.send_more(io);

        self.sessions.insert(request_id, session);
        self.messages_routed += 1;

        RouteMessageAck::ok(request_id)
    }

    fn add_to_duplicate_detector(&mut self, request_id: RequestId) {
        self.duplicate_detector.add(request_id);
    }

    fn is_most_likely_duplicate(&self, request_id: &RequestId) -> bool {
        self.duplicate_detector.is_most_likely_duplicate(request_id)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DuplicateDetector::default())
    }
}
