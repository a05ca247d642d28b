//! Iterative closest-peer lookups.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{
    methods, ClosestPeers, ClosestPeersRequest, DataEntry, Distance, FindDataRequest, NodeId,
    PeerDescriptor, RecursiveOperation, RequestId, MAX_BUCKET_SIZE_K,
};
use crate::rpc::{Outbox, RpcError};

use super::{merge_entry, LookupError, PeerResponse, RecursiveOperationResult};

/// An iterative process of sending a request to the closest known peers to
/// the target in sequential rounds, merging the closer peers they return, and
/// repeating until a round brings nothing closer.
#[derive(Debug)]
pub(crate) struct FindQuery {
    id: RequestId,
    operation: RecursiveOperation,
    local: PeerDescriptor,
    candidates: ClosestPeers,
    responders: ClosestPeers,
    queried: HashSet<NodeId>,
    inflight: HashMap<RequestId, PeerDescriptor>,
    entries: HashMap<NodeId, DataEntry>,
    parallelism: usize,
    round: usize,
    best: Option<Distance>,
    final_round: bool,
    started_at: Instant,
}

impl FindQuery {
    pub fn new(
        id: RequestId,
        operation: RecursiveOperation,
        target: NodeId,
        local: PeerDescriptor,
        seeds: Vec<PeerDescriptor>,
        parallelism: usize,
    ) -> Self {
        trace!(?target, ?operation, seeds = seeds.len(), "New find query");

        let mut query = Self {
            id,
            operation,
            candidates: ClosestPeers::new(target),
            responders: ClosestPeers::new(target),
            local,
            queried: HashSet::new(),
            inflight: HashMap::new(),
            entries: HashMap::new(),
            parallelism: parallelism.max(1),
            round: 0,
            best: None,
            final_round: false,
            started_at: Instant::now(),
        };

        query.add_candidates(seeds);
        query.best = query.best_distance();

        query
    }

    // === Getters ===

    pub fn target(&self) -> &NodeId {
        self.candidates.target()
    }

    pub fn round(&self) -> usize {
        self.round
    }

    /// Return true if a response (by request id) is expected by this query.
    pub fn is_inflight(&self, request_id: &RequestId) -> bool {
        self.inflight.contains_key(request_id)
    }

    // === Public Methods ===

    /// Send the first round.
    pub fn start(&mut self, outbox: &mut Outbox) {
        self.next_round(outbox, self.parallelism);
    }

    /// Entries already known before asking anyone, for example from the local store.
    pub fn add_entries(&mut self, entries: impl IntoIterator<Item = DataEntry>) {
        for entry in entries {
            merge_entry(&mut self.entries, entry);
        }
    }

    /// Settle one request of the current round.
    pub fn on_response(
        &mut self,
        request_id: &RequestId,
        result: Result<PeerResponse, RpcError>,
    ) -> bool {
        let Some(peer) = self.inflight.remove(request_id) else {
            return false;
        };

        match result {
            Ok(response) => {
                trace!(target = ?self.target(), from = ?peer.node_id(), peers = response.peers.len(), entries = response.entries.len(), "Find query got response");

                let target = *self.target();

                self.add_candidates(response.peers);
                self.add_entries(
                    response
                        .entries
                        .into_iter()
                        .filter(|entry| entry.key == target),
                );
                self.responders.add(peer);
            }
            Err(error) => {
                trace!(target = ?self.target(), from = ?peer.node_id(), ?error, "Dropping failed peer from find query");

                self.candidates.remove(peer.node_id());
            }
        }

        true
    }

    /// Start the next round once the current one settled.
    ///
    /// Returns the outcome once the query is done.
    pub fn tick(
        &mut self,
        outbox: &mut Outbox,
        max_rounds: usize,
        timeout: Duration,
    ) -> Option<Result<RecursiveOperationResult, LookupError>> {
        if self.started_at.elapsed() >= timeout {
            debug!(target = ?self.target(), round = self.round, "Find query timed out");

            if self.responders.is_empty() {
                return Some(Err(LookupError::Timeout));
            }

            return Some(self.finish());
        }

        if !self.inflight.is_empty() {
            return None;
        }

        if self.final_round {
            return Some(self.finish());
        }

        let best = self.best_distance();
        let progress = match (self.best, best) {
            (Some(previous), Some(best)) => best < previous,
            (None, Some(_)) => true,
            _ => false,
        };
        self.best = best;

        let sent = if progress && self.round < max_rounds {
            self.next_round(outbox, self.parallelism)
        } else {
            // One last round over every unqueried peer among the k closest.
            self.final_round = true;
            self.next_round(outbox, MAX_BUCKET_SIZE_K)
        };

        if sent == 0 {
            return Some(self.finish());
        }

        None
    }

    // === Private Methods ===

    fn add_candidates(&mut self, peers: Vec<PeerDescriptor>) {
        for peer in peers {
            if peer.node_id() != self.local.node_id() {
                self.candidates.add(peer);
            }
        }
    }

    fn best_distance(&self) -> Option<Distance> {
        self.candidates
            .first()
            .map(|peer| peer.node_id().distance(self.candidates.target()))
    }

    /// Query up to `fanout` of the closest peers not queried yet.
    fn next_round(&mut self, outbox: &mut Outbox, fanout: usize) -> usize {
        let to_visit = self
            .candidates
            .closest(MAX_BUCKET_SIZE_K.max(fanout))
            .iter()
            .filter(|peer| !self.queried.contains(peer.node_id()))
            .take(fanout)
            .cloned()
            .collect::<Vec<_>>();

        if to_visit.is_empty() {
            return 0;
        }

        self.round += 1;

        trace!(target = ?self.target(), round = self.round, peers = to_visit.len(), "Find query round");

        for peer in &to_visit {
            let target = *self.candidates.target();

            let request_id = match self.operation {
                RecursiveOperation::FindData => outbox.call(
                    methods::FIND_DATA,
                    &FindDataRequest {
                        key: target,
                        request_id: self.id,
                    },
                    peer,
                ),
                RecursiveOperation::FindClosestNodes | RecursiveOperation::StoreData => outbox
                    .call(
                        methods::GET_CLOSEST_PEERS,
                        &ClosestPeersRequest {
                            node_id: target,
                            request_id: self.id,
                        },
                        peer,
                    ),
            };

            self.queried.insert(*peer.node_id());
            self.inflight.insert(request_id, peer.clone());
        }

        to_visit.len()
    }

    fn finish(&mut self) -> Result<RecursiveOperationResult, LookupError> {
        debug!(
            target = ?self.target(),
            operation = ?self.operation,
            rounds = self.round,
            queried = self.queried.len(),
            responders = self.responders.len(),
            "Done find query"
        );

        if self.responders.is_empty() {
            return Err(LookupError::NoPeersReachable);
        }

        let mut closest = self.responders.clone();

        let closest_nodes = match self.operation {
            // Replica placement ranks this node among the candidates.
            RecursiveOperation::StoreData => {
                closest.add(self.local.clone());
                closest.into_iter().collect()
            }
            RecursiveOperation::FindClosestNodes | RecursiveOperation::FindData => {
                closest.closest(MAX_BUCKET_SIZE_K).to_vec()
            }
        };

        let mut data_entries = self.entries.values().cloned().collect::<Vec<_>>();
        data_entries.sort_by(|a, b| a.creator.node_id().cmp(b.creator.node_id()));

        Ok(RecursiveOperationResult {
            closest_nodes,
            data_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::common::{NodeType, ID_SIZE};

    use super::*;

    fn peer(first_byte: u8) -> PeerDescriptor {
        let mut bytes = [0; ID_SIZE];
        bytes[0] = first_byte;

        PeerDescriptor::new(NodeId::from_bytes(bytes).unwrap(), NodeType::Native)
    }

    fn target() -> NodeId {
        NodeId::from_bytes([0; ID_SIZE]).unwrap()
    }

    fn sent_ids(outbox: &Outbox) -> Vec<(RequestId, PeerDescriptor)> {
        outbox
            .calls()
            .iter()
            .map(|call| (call.request_id, call.target.clone()))
            .collect()
    }

    #[test]
    fn rounds_are_sequential() {
        let mut query = FindQuery::new(
            RequestId::random(),
            RecursiveOperation::FindClosestNodes,
            target(),
            peer(0xff),
            vec![peer(0x40), peer(0x80)],
            1,
        );

        let mut outbox = Outbox::new();
        query.start(&mut outbox);

        let calls = sent_ids(&outbox);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, peer(0x40));
        assert_eq!(outbox.calls()[0].method, methods::GET_CLOSEST_PEERS);

        // Nothing new while the round is inflight.
        let mut next = Outbox::new();
        assert!(query.tick(&mut next, 10, Duration::from_secs(10)).is_none());
        assert!(next.is_empty());

        query.on_response(
            &calls[0].0,
            Ok(PeerResponse {
                peers: vec![peer(0x10)],
                entries: vec![],
            }),
        );

        assert!(query.tick(&mut next, 10, Duration::from_secs(10)).is_none());
        assert_eq!(next.calls()[0].target, peer(0x10));
        assert_eq!(query.round(), 2);
    }

    #[test]
    fn final_round_then_done() {
        let mut query = FindQuery::new(
            RequestId::random(),
            RecursiveOperation::FindClosestNodes,
            target(),
            peer(0xff),
            vec![peer(0x10), peer(0x20)],
            1,
        );

        let mut outbox = Outbox::new();
        query.start(&mut outbox);
        let first = sent_ids(&outbox);

        // No closer peers returned.
        query.on_response(&first[0].0, Ok(PeerResponse::default()));

        let mut outbox = Outbox::new();
        assert!(query.tick(&mut outbox, 10, Duration::from_secs(10)).is_none());

        // The final round visits the remaining unqueried peer.
        let last = sent_ids(&outbox);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].1, peer(0x20));

        query.on_response(&last[0].0, Ok(PeerResponse::default()));

        let result = query
            .tick(&mut Outbox::new(), 10, Duration::from_secs(10))
            .unwrap()
            .unwrap();

        assert_eq!(result.closest_nodes, vec![peer(0x10), peer(0x20)]);
    }

    #[test]
    fn failed_peers_are_dropped() {
        let mut query = FindQuery::new(
            RequestId::random(),
            RecursiveOperation::FindClosestNodes,
            target(),
            peer(0xff),
            vec![peer(0x10), peer(0x20)],
            2,
        );

        let mut outbox = Outbox::new();
        query.start(&mut outbox);
        let calls = sent_ids(&outbox);

        query.on_response(&calls[0].0, Err(RpcError::Timeout));
        query.on_response(&calls[1].0, Ok(PeerResponse::default()));

        let result = query
            .tick(&mut Outbox::new(), 10, Duration::from_secs(10))
            .unwrap()
            .unwrap();

        assert_eq!(result.closest_nodes, vec![peer(0x20)]);
    }

    #[test]
    fn no_peers_reachable() {
        let mut query = FindQuery::new(
            RequestId::random(),
            RecursiveOperation::FindClosestNodes,
            target(),
            peer(0xff),
            vec![peer(0x10)],
            2,
        );

        let mut outbox = Outbox::new();
        query.start(&mut outbox);
        let calls = sent_ids(&outbox);

        query.on_response(&calls[0].0, Err(RpcError::Timeout));

        let result = query.tick(&mut Outbox::new(), 10, Duration::from_secs(10));

        assert!(matches!(result, Some(Err(LookupError::NoPeersReachable))));
    }

    #[test]
    fn store_placement_ranks_local_node() {
        let local = peer(0x08);

        let mut query = FindQuery::new(
            RequestId::random(),
            RecursiveOperation::StoreData,
            target(),
            local.clone(),
            vec![peer(0x10)],
            2,
        );

        let mut outbox = Outbox::new();
        query.start(&mut outbox);
        let calls = sent_ids(&outbox);

        query.on_response(&calls[0].0, Ok(PeerResponse::default()));

        let result = query
            .tick(&mut Outbox::new(), 10, Duration::from_secs(10))
            .unwrap()
            .unwrap();

        assert_eq!(result.closest_nodes, vec![local, peer(0x10)]);
    }

    #[test]
    fn find_data_collects_newest_entries() {
        let creator = peer(0x30);

        let entry = |created_at: u64, data: &'static [u8]| DataEntry {
            key: target(),
            data: Bytes::from_static(data),
            creator: creator.clone(),
            ttl: 60_000,
            created_at,
            stale: false,
            deleted: false,
        };

        let mut query = FindQuery::new(
            RequestId::random(),
            RecursiveOperation::FindData,
            target(),
            peer(0xff),
            vec![peer(0x10), peer(0x20)],
            2,
        );

        let mut outbox = Outbox::new();
        query.start(&mut outbox);
        assert_eq!(outbox.calls()[0].method, methods::FIND_DATA);

        let calls = sent_ids(&outbox);

        query.on_response(
            &calls[0].0,
            Ok(PeerResponse {
                peers: vec![],
                entries: vec![entry(2, b"new")],
            }),
        );
        query.on_response(
            &calls[1].0,
            Ok(PeerResponse {
                peers: vec![],
                entries: vec![entry(1, b"old")],
            }),
        );

        let result = query
            .tick(&mut Outbox::new(), 10, Duration::from_secs(10))
            .unwrap()
            .unwrap();

        assert_eq!(result.data_entries.len(), 1);
        assert_eq!(result.data_entries[0].data, Bytes::from_static(b"new"));
    }

    #[test]
    fn timeout_without_responders() {
        let mut query = FindQuery::new(
            RequestId::random(),
            RecursiveOperation::FindClosestNodes,
            target(),
            peer(0xff),
            vec![peer(0x10)],
            2,
        );

        query.start(&mut Outbox::new());

        let result = query.tick(&mut Outbox::new(), 10, Duration::ZERO);

        assert!(matches!(result, Some(Err(LookupError::Timeout))));
    }
}
