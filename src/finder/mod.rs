//! Closest-node and closest-data lookups.
//!
//! Iterative lookups ask peers directly, round after round. Recursive
//! operations are routed hop by hop toward the target, every hop reporting
//! back to the origin.

mod query;
mod session;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{
    is_closer, ClosestPeers, DataEntry, Message, MessageBody, NodeId, PeerDescriptor,
    RecursiveOperation, RecursiveOperationRequest, RecursiveOperationResponse, RequestId,
    RouteMessageAck, RouteMessageError, RouteMessageWrapper, DHT_SERVICE_ID, MAX_BUCKET_SIZE_K,
};
use crate::router::{Router, RouterIo, Routing, RoutingMode};
use crate::rpc::{Outbox, RpcError};

use query::FindQuery;
use session::RecursiveSession;

/// Default deadline of a whole lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);
/// Default budget of sequential rounds per lookup.
pub const DEFAULT_MAX_LOOKUP_ROUNDS: usize = 10;
/// How long the origin of a recursive operation waits for reports.
pub const RECURSIVE_SESSION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default, PartialEq)]
/// Outcome of a lookup.
pub struct RecursiveOperationResult {
    /// Sorted by distance to the target, closest first.
    pub closest_nodes: Vec<PeerDescriptor>,
    /// At most one entry per creator, the newest known.
    pub data_entries: Vec<DataEntry>,
}

#[derive(Debug, Clone, Default)]
/// What a single peer answered to a lookup request.
pub struct PeerResponse {
    pub peers: Vec<PeerDescriptor>,
    pub entries: Vec<DataEntry>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Every queried peer failed.
    #[error("No peers reachable")]
    NoPeersReachable,

    #[error("Lookup timed out before any peer responded")]
    Timeout,
}

type Completed = (RequestId, Result<RecursiveOperationResult, LookupError>);

#[derive(Debug)]
pub struct Finder {
    parallelism: usize,
    lookup_timeout: Duration,
    max_rounds: usize,
    queries: HashMap<RequestId, FindQuery>,
    sessions: HashMap<RequestId, RecursiveSession>,
    completed: Vec<Completed>,
}

impl Finder {
    pub fn new(parallelism: usize, lookup_timeout: Duration, max_rounds: usize) -> Self {
        Self {
            parallelism,
            lookup_timeout,
            max_rounds,
            queries: HashMap::new(),
            sessions: HashMap::new(),
            completed: Vec::new(),
        }
    }

    // === Getters ===

    pub fn active_queries(&self) -> usize {
        self.queries.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if `request_id` is a request of one of our lookups.
    pub fn owns(&self, request_id: &RequestId) -> bool {
        self.queries
            .values()
            .any(|query| query.is_inflight(request_id))
    }

    // === Public Methods ===

    /// Start an iterative lookup toward `target`.
    ///
    /// `seeds` are the peers to ask first. Without any, the lookup completes
    /// right away with this node as the sole closest node.
    pub fn execute(
        &mut self,
        target: NodeId,
        operation: RecursiveOperation,
        local: &PeerDescriptor,
        seeds: Vec<PeerDescriptor>,
        local_entries: Vec<DataEntry>,
        outbox: &mut Outbox,
    ) -> RequestId {
        let id = RequestId::random();

        let seeds = seeds
            .into_iter()
            .filter(|peer| peer.node_id() != local.node_id())
            .collect::<Vec<_>>();

        let local_entries = match operation {
            RecursiveOperation::FindData => local_entries,
            RecursiveOperation::FindClosestNodes | RecursiveOperation::StoreData => vec![],
        };

        if seeds.is_empty() {
            debug!(?target, ?operation, "No peers to ask, this node is the closest");

            self.completed.push((
                id,
                Ok(RecursiveOperationResult {
                    closest_nodes: vec![local.clone()],
                    data_entries: local_entries,
                }),
            ));

            return id;
        }

        let mut query = FindQuery::new(
            id,
            operation,
            target,
            local.clone(),
            seeds,
            self.parallelism,
        );
        query.add_entries(local_entries);
        query.start(outbox);

        self.queries.insert(id, query);

        id
    }

    /// Settle a `getClosestPeers` or `findData` request. Returns false if no lookup owns it.
    pub fn on_response(
        &mut self,
        request_id: &RequestId,
        result: Result<PeerResponse, RpcError>,
    ) -> bool {
        match self
            .queries
            .values_mut()
            .find(|query| query.is_inflight(request_id))
        {
            Some(query) => query.on_response(request_id, result),
            None => false,
        }
    }

    /// Start a recursive operation toward `target`, routed through our connections.
    pub fn find_recursively(
        &mut self,
        target: NodeId,
        operation: RecursiveOperation,
        local_entries: Vec<DataEntry>,
        router: &mut Router,
        io: &mut dyn RouterIo,
    ) -> RequestId {
        let session_id = RequestId::random();
        let local = io.local_peer_descriptor().clone();
        let connections = io.connections().len();

        let local_entries = match operation {
            RecursiveOperation::FindData => local_entries,
            RecursiveOperation::FindClosestNodes | RecursiveOperation::StoreData => vec![],
        };

        let mut session = RecursiveSession::new(
            session_id,
            operation,
            target,
            if connections > 1 { 2 } else { 1 },
        );
        session.add_local(local.clone(), local_entries);

        let message = Message::new(
            DHT_SERVICE_ID,
            local,
            None,
            MessageBody::RecursiveOperationRequest(RecursiveOperationRequest {
                session_id,
                operation,
            }),
        );

        let ack = router.send_recursive(message, target, io);

        match ack.error {
            None => {
                self.sessions.insert(session_id, session);
            }
            Some(error) => {
                debug!(?session_id, ?error, "Recursive operation could not leave this node");

                self.completed.push((session_id, Ok(session.result())));
            }
        }

        session_id
    }

    /// Merge a report sent by a hop of one of our recursive operations.
    pub fn on_report(&mut self, response: RecursiveOperationResponse) -> bool {
        let session_id = response.session_id;

        let Some(session) = self.sessions.get_mut(&session_id) else {
            trace!(?session_id, "Report for an unknown recursive session");
            return false;
        };

        if session.on_report(response) {
            if let Some(session) = self.sessions.remove(&session_id) {
                debug!(?session_id, operation = ?session.operation(), reports = session.reports(), "Recursive operation done");

                self.completed.push((session_id, Ok(session.result())));
            }
        }

        true
    }

    /// Advance lookups to their next round, and expire old sessions.
    pub fn tick(&mut self, outbox: &mut Outbox) {
        let mut done = Vec::new();

        for (id, query) in self.queries.iter_mut() {
            if let Some(result) = query.tick(outbox, self.max_rounds, self.lookup_timeout) {
                done.push((*id, result));
            }
        }

        for (id, _) in &done {
            self.queries.remove(id);
        }

        self.completed.extend(done);

        let expired = self
            .sessions
            .iter()
            .filter(|(_, session)| session.started_at.elapsed() >= RECURSIVE_SESSION_TIMEOUT)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in expired {
            if let Some(session) = self.sessions.remove(&id) {
                debug!(session_id = ?session.session_id(), reports = session.reports(), "Recursive operation timed out");

                self.completed.push((id, Ok(session.result())));
            }
        }
    }

    /// Lookups done since the last call.
    pub fn take_completed(&mut self) -> Vec<Completed> {
        std::mem::take(&mut self.completed)
    }
}

/// Serve a routed find request as one of its hops.
///
/// Reports this hop's closest connected peers, and its entries for a data
/// lookup, to the origin and keeps routing toward the target while a closer
/// connection exists. Anything but a find request is rejected.
pub fn handle_routed_request(
    wrapper: RouteMessageWrapper,
    local_entries: Vec<DataEntry>,
    router: &mut dyn Routing,
    io: &mut dyn RouterIo,
) -> Result<(RouteMessageAck, Option<(PeerDescriptor, RecursiveOperationResponse)>), RpcError> {
    let (session_id, operation) = match &wrapper.message.body {
        MessageBody::RecursiveOperationRequest(request) => (request.session_id, request.operation),
        MessageBody::FindRequest(request) => {
            (request.session_id, RecursiveOperation::FindClosestNodes)
        }
        MessageBody::Rpc(_) => {
            return Err(RpcError::Payload(
                "routed message is not a find request".to_string(),
            ))
        }
    };

    let request_id = wrapper.request_id;

    if router.is_most_likely_duplicate(&request_id) {
        return Ok((
            RouteMessageAck::error(request_id, RouteMessageError::Duplicate),
            None,
        ));
    }
    router.add_to_duplicate_detector(request_id);

    let local = io.local_peer_descriptor().clone();
    let target = wrapper.target;
    let origin = wrapper.source_peer.clone();

    let mut excluded = wrapper
        .routing_path
        .iter()
        .map(|peer| *peer.node_id())
        .collect::<HashSet<_>>();
    excluded.insert(*origin.node_id());

    let connections = io.connections();

    let mut closest_connected = ClosestPeers::new(target);
    closest_connected.add(local.clone());
    closest_connected.extend(
        connections
            .iter()
            .filter(|peer| peer.node_id() != origin.node_id())
            .cloned(),
    );

    let has_closer = connections.iter().any(|peer| {
        !excluded.contains(peer.node_id()) && is_closer(peer.node_id(), &target, local.node_id())
    });

    let mut routing_path = wrapper.routing_path.clone();
    routing_path.push(local.clone());

    let ack = if has_closer && target != *local.node_id() {
        router.do_route_message(wrapper, RoutingMode::Recursive, io)
    } else {
        RouteMessageAck::ok(request_id)
    };

    let no_closer_nodes_found = !has_closer || !ack.is_ok();

    let data_entries = match operation {
        RecursiveOperation::FindData => local_entries
            .into_iter()
            .filter(|entry| entry.key == target)
            .collect(),
        RecursiveOperation::FindClosestNodes | RecursiveOperation::StoreData => vec![],
    };

    trace!(?session_id, ?target, no_closer_nodes_found, "Served routed find request");

    let report = RecursiveOperationResponse {
        session_id,
        closest_connected_peers: closest_connected.closest(MAX_BUCKET_SIZE_K).to_vec(),
        data_entries,
        routing_path,
        no_closer_nodes_found,
    };

    // Routing failures are part of the report, the request itself was served.
    let ack = match ack.error {
        Some(RouteMessageError::NoTargets) => RouteMessageAck::ok(request_id),
        _ => ack,
    };

    Ok((ack, Some((origin, report))))
}

/// Keep the newest entry per creator. A tombstone wins a tie.
pub(crate) fn merge_entry(entries: &mut HashMap<NodeId, DataEntry>, entry: DataEntry) {
    match entries.entry(*entry.creator.node_id()) {
        Entry::Occupied(mut occupied) => {
            let existing = occupied.get_mut();

            if entry.created_at > existing.created_at
                || (entry.created_at == existing.created_at && entry.deleted && !existing.deleted)
            {
                *existing = entry;
            }
        }
        Entry::Vacant(vacant) => {
            vacant.insert(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::common::{FindRequest, RpcMessage, RpcPayload};
    use crate::router::tests::{peer, FakeIo};

    use super::*;

    fn finder() -> Finder {
        Finder::new(MAX_BUCKET_SIZE_K, DEFAULT_LOOKUP_TIMEOUT, DEFAULT_MAX_LOOKUP_ROUNDS)
    }

    fn find_wrapper(
        source: &PeerDescriptor,
        target: &PeerDescriptor,
        operation: RecursiveOperation,
    ) -> RouteMessageWrapper {
        RouteMessageWrapper {
            message: Message::new(
                DHT_SERVICE_ID,
                source.clone(),
                None,
                MessageBody::RecursiveOperationRequest(RecursiveOperationRequest {
                    session_id: RequestId::random(),
                    operation,
                }),
            ),
            request_id: RequestId::random(),
            source_peer: source.clone(),
            target: *target.node_id(),
            routing_path: vec![source.clone()],
            reachable_through: vec![],
        }
    }

    fn entry(key: &PeerDescriptor, creator: &PeerDescriptor) -> DataEntry {
        DataEntry {
            key: *key.node_id(),
            data: Bytes::from_static(b"data"),
            creator: creator.clone(),
            ttl: 60_000,
            created_at: 1,
            stale: false,
            deleted: false,
        }
    }

    #[test]
    fn empty_routing_table_returns_self() {
        let local = peer(0x10);
        let mut finder = finder();
        let mut outbox = Outbox::new();

        let id = finder.execute(
            NodeId::random(),
            RecursiveOperation::FindClosestNodes,
            &local,
            vec![local.clone()],
            vec![],
            &mut outbox,
        );

        assert!(outbox.is_empty());

        let completed = finder.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, id);
        assert_eq!(
            completed[0].1.as_ref().unwrap().closest_nodes,
            vec![local]
        );
    }

    #[test]
    fn lookup_through_finder() {
        let local = peer(0xff);
        let mut finder = finder();
        let mut outbox = Outbox::new();

        finder.execute(
            *peer(0x00).node_id(),
            RecursiveOperation::FindClosestNodes,
            &local,
            vec![peer(0x10)],
            vec![],
            &mut outbox,
        );

        let request_id = outbox.calls()[0].request_id;
        assert!(finder.owns(&request_id));

        assert!(finder.on_response(&request_id, Ok(PeerResponse::default())));
        assert!(!finder.on_response(&request_id, Ok(PeerResponse::default())));

        finder.tick(&mut Outbox::new());

        let completed = finder.take_completed();
        assert_eq!(completed[0].1.as_ref().unwrap().closest_nodes, vec![peer(0x10)]);
        assert_eq!(finder.active_queries(), 0);
    }

    #[test]
    fn reject_rpc_payload() {
        let local = peer(0x10);
        let source = peer(0x20);
        let mut io = FakeIo::new(local.clone(), vec![]);
        let mut router = Router::default();

        let mut wrapper = find_wrapper(&source, &peer(0x30), RecursiveOperation::FindData);
        wrapper.message.body = MessageBody::Rpc(RpcMessage {
            request_id: RequestId::random(),
            method: "ping".to_string(),
            payload: RpcPayload::Request(Bytes::new()),
        });

        let result = handle_routed_request(wrapper, vec![], &mut router, &mut io);

        assert!(matches!(result, Err(RpcError::Payload(_))));
    }

    #[test]
    fn last_hop_reports_no_closer_nodes() {
        let local = peer(0x10);
        let source = peer(0xf0);
        let key = peer(0x11);
        let mut io = FakeIo::new(local.clone(), vec![peer(0x80)]);
        let mut router = Router::default();

        let wrapper = find_wrapper(&source, &key, RecursiveOperation::FindData);

        let (ack, report) = handle_routed_request(
            wrapper,
            vec![entry(&key, &source), entry(&peer(0x99), &source)],
            &mut router,
            &mut io,
        )
        .unwrap();

        assert!(ack.is_ok());
        assert!(io.sent.is_empty());

        let (origin, report) = report.unwrap();
        assert_eq!(origin, source);
        assert!(report.no_closer_nodes_found);
        assert_eq!(report.data_entries.len(), 1);
        assert_eq!(report.routing_path, vec![source, local.clone()]);
        assert_eq!(report.closest_connected_peers[0], local);
    }

    #[test]
    fn hop_routes_toward_closer_connection() {
        let local = peer(0x40);
        let source = peer(0xf0);
        let key = peer(0x01);
        let closer = peer(0x02);
        let mut io = FakeIo::new(local, vec![closer.clone()]);
        let mut router = Router::default();

        let wrapper = find_wrapper(&source, &key, RecursiveOperation::FindClosestNodes);
        let request_id = wrapper.request_id;

        let (ack, report) = handle_routed_request(wrapper.clone(), vec![], &mut router, &mut io).unwrap();

        assert!(ack.is_ok());
        assert!(!report.unwrap().1.no_closer_nodes_found);
        assert_eq!(io.sent.len(), 1);
        assert_eq!(io.sent[0].0, RoutingMode::Recursive);
        assert_eq!(io.sent[0].1, closer);
        assert!(router.is_most_likely_duplicate(&request_id));

        let (ack, report) = handle_routed_request(wrapper, vec![], &mut router, &mut io).unwrap();
        assert_eq!(ack.error, Some(RouteMessageError::Duplicate));
        assert!(report.is_none());
    }

    #[test]
    fn find_request_is_a_closest_nodes_lookup() {
        let local = peer(0x10);
        let source = peer(0xf0);
        let mut io = FakeIo::new(local, vec![]);
        let mut router = Router::default();

        let mut wrapper = find_wrapper(&source, &peer(0x11), RecursiveOperation::FindData);
        let session_id = RequestId::random();
        wrapper.message.body = MessageBody::FindRequest(FindRequest { session_id });

        let (_, report) = handle_routed_request(
            wrapper,
            vec![entry(&peer(0x11), &source)],
            &mut router,
            &mut io,
        )
        .unwrap();

        let report = report.unwrap().1;
        assert_eq!(report.session_id, session_id);
        assert!(report.data_entries.is_empty());
    }

    #[test]
    fn recursive_without_connections_completes_with_self() {
        let local = peer(0x10);
        let key = peer(0x11);
        let mut io = FakeIo::new(local.clone(), vec![]);
        let mut router = Router::default();
        let mut finder = finder();

        let id = finder.find_recursively(
            *key.node_id(),
            RecursiveOperation::FindData,
            vec![entry(&key, &local)],
            &mut router,
            &mut io,
        );

        let completed = finder.take_completed();
        assert_eq!(completed[0].0, id);

        let result = completed[0].1.as_ref().unwrap();
        assert_eq!(result.closest_nodes, vec![local]);
        assert_eq!(result.data_entries.len(), 1);
    }

    #[test]
    fn recursive_session_completes_on_report() {
        let local = peer(0x80);
        let key = peer(0x01);
        let hop = peer(0x02);
        let mut io = FakeIo::new(local.clone(), vec![hop.clone()]);
        let mut router = Router::default();
        let mut finder = finder();

        let id = finder.find_recursively(
            *key.node_id(),
            RecursiveOperation::FindClosestNodes,
            vec![],
            &mut router,
            &mut io,
        );

        assert_eq!(finder.active_sessions(), 1);
        assert!(finder.take_completed().is_empty());

        assert!(finder.on_report(RecursiveOperationResponse {
            session_id: id,
            closest_connected_peers: vec![hop.clone()],
            data_entries: vec![],
            routing_path: vec![local.clone(), hop.clone()],
            no_closer_nodes_found: true,
        }));

        let completed = finder.take_completed();
        assert_eq!(completed[0].1.as_ref().unwrap().closest_nodes, vec![hop, local]);
        assert_eq!(finder.active_sessions(), 0);
    }

    #[test]
    fn merge_keeps_newest_per_creator() {
        let key = peer(0x01);
        let creator = peer(0x02);

        let mut entries = HashMap::new();

        let mut newer = entry(&key, &creator);
        newer.created_at = 5;
        merge_entry(&mut entries, newer);
        merge_entry(&mut entries, entry(&key, &creator));

        assert_eq!(entries[creator.node_id()].created_at, 5);

        let mut tombstone = entry(&key, &creator);
        tombstone.created_at = 5;
        tombstone.deleted = true;
        merge_entry(&mut entries, tombstone);

        assert!(entries[creator.node_id()].deleted);
    }
}
