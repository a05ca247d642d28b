use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::common::{
    methods, ClosestPeers, DataEntry, DeleteDataRequest, NodeId, PeerDescriptor, RequestId,
    StoreDataRequest,
};
use crate::rpc::Outbox;

use super::LocalDataStore;

#[derive(Debug, Clone)]
pub(crate) enum StoreRequest {
    /// Store this entry, created by this node.
    Store(DataEntry),
    /// Tombstone this node's entry under the key.
    Delete,
}

#[derive(Debug)]
/// Write a request to the closest candidates of a key until enough of them
/// accepted it, replacing failed candidates with the next closest ones.
pub(crate) struct StoreQuery {
    key: NodeId,
    request: StoreRequest,
    copies: usize,
    candidates: VecDeque<PeerDescriptor>,
    inflight: HashMap<RequestId, PeerDescriptor>,
    stored: ClosestPeers,
    failed: usize,
}

impl StoreQuery {
    pub fn new(
        key: NodeId,
        request: StoreRequest,
        candidates: Vec<PeerDescriptor>,
        copies: usize,
    ) -> Self {
        Self {
            key,
            request,
            copies,
            candidates: candidates.into(),
            inflight: HashMap::new(),
            stored: ClosestPeers::new(key),
            failed: 0,
        }
    }

    // === Getters ===

    pub fn key(&self) -> &NodeId {
        &self.key
    }

    pub fn is_inflight(&self, request_id: &RequestId) -> bool {
        self.inflight.contains_key(request_id)
    }

    pub fn is_done(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Peers that accepted the request, closest to the key first.
    pub fn stored(&self) -> &[PeerDescriptor] {
        self.stored.peers()
    }

    // === Public Methods ===

    pub fn start(&mut self, local: &PeerDescriptor, store: &mut LocalDataStore, outbox: &mut Outbox) {
        self.send_more(local, store, outbox);
    }

    /// Settle a request. A failed candidate is replaced by the next one.
    pub fn on_response(
        &mut self,
        request_id: &RequestId,
        accepted: bool,
        local: &PeerDescriptor,
        store: &mut LocalDataStore,
        outbox: &mut Outbox,
    ) -> bool {
        let Some(peer) = self.inflight.remove(request_id) else {
            return false;
        };

        if accepted {
            trace!(key = ?self.key, peer = ?peer.node_id(), "Replica accepted");
            self.stored.add(peer);
        } else {
            debug!(key = ?self.key, peer = ?peer.node_id(), "Replica failed, trying the next candidate");
            self.failed += 1;
            self.send_more(local, store, outbox);
        }

        true
    }

    // === Private Methods ===

    fn send_more(&mut self, local: &PeerDescriptor, store: &mut LocalDataStore, outbox: &mut Outbox) {
        while self.stored.len() + self.inflight.len() < self.copies {
            let Some(peer) = self.candidates.pop_front() else {
                break;
            };

            if peer.node_id() == local.node_id() {
                let accepted = match &self.request {
                    StoreRequest::Store(entry) => store.store_entry(entry.clone()),
                    StoreRequest::Delete => store.mark_as_deleted(&self.key, local.node_id()),
                };

                if accepted {
                    self.stored.add(peer);
                }

                continue;
            }

            let request_id = match &self.request {
                StoreRequest::Store(entry) => outbox.call(
                    methods::STORE_DATA,
                    &StoreDataRequest {
                        key: entry.key,
                        data: entry.data.clone(),
                        ttl: entry.ttl,
                        created_at: entry.created_at,
                    },
                    &peer,
                ),
                StoreRequest::Delete => {
                    outbox.call(methods::DELETE_DATA, &DeleteDataRequest { key: self.key }, &peer)
                }
            };

            self.inflight.insert(request_id, peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::common::unix_millis;
    use crate::router::tests::peer;

    use super::*;

    fn entry(key: &PeerDescriptor, creator: &PeerDescriptor) -> DataEntry {
        DataEntry {
            key: *key.node_id(),
            data: Bytes::from_static(b"data"),
            creator: creator.clone(),
            ttl: 60_000,
            created_at: unix_millis(),
            stale: false,
            deleted: false,
        }
    }

    #[test]
    fn store_to_closest_and_locally() {
        let key = peer(0x00);
        let local = peer(0x01);

        let mut store = LocalDataStore::new();
        let mut outbox = Outbox::new();

        let mut query = StoreQuery::new(
            *key.node_id(),
            StoreRequest::Store(entry(&key, &local)),
            vec![local.clone(), peer(0x02), peer(0x03)],
            2,
        );
        query.start(&local, &mut store, &mut outbox);

        assert_eq!(store.len(), 1);
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.calls()[0].target, peer(0x02));
        assert_eq!(outbox.calls()[0].method, methods::STORE_DATA);

        let request_id = outbox.calls()[0].request_id;
        assert!(query.on_response(&request_id, true, &local, &mut store, &mut Outbox::new()));

        assert!(query.is_done());
        assert_eq!(query.stored(), &[local, peer(0x02)]);
    }

    #[test]
    fn replace_failed_candidates() {
        let key = peer(0x00);
        let local = peer(0xff);

        let mut store = LocalDataStore::new();
        let mut outbox = Outbox::new();

        let mut query = StoreQuery::new(
            *key.node_id(),
            StoreRequest::Store(entry(&key, &local)),
            vec![peer(0x01), peer(0x02), peer(0x03)],
            2,
        );
        query.start(&local, &mut store, &mut outbox);
        assert_eq!(outbox.len(), 2);

        let first = outbox.calls()[0].request_id;
        let second = outbox.calls()[1].request_id;

        let mut retry = Outbox::new();
        query.on_response(&first, false, &local, &mut store, &mut retry);
        assert_eq!(retry.calls()[0].target, peer(0x03));

        query.on_response(&second, true, &local, &mut store, &mut Outbox::new());
        query.on_response(&retry.calls()[0].request_id, true, &local, &mut store, &mut Outbox::new());

        assert!(query.is_done());
        assert_eq!(query.stored(), &[peer(0x02), peer(0x03)]);
    }

    #[test]
    fn reduced_redundancy() {
        let key = peer(0x00);
        let local = peer(0xff);

        let mut store = LocalDataStore::new();
        let mut outbox = Outbox::new();

        let mut query = StoreQuery::new(
            *key.node_id(),
            StoreRequest::Delete,
            vec![peer(0x01), peer(0x02)],
            2,
        );
        query.start(&local, &mut store, &mut outbox);
        assert_eq!(outbox.calls()[0].method, methods::DELETE_DATA);

        let first = outbox.calls()[0].request_id;
        let second = outbox.calls()[1].request_id;

        query.on_response(&first, false, &local, &mut store, &mut Outbox::new());
        query.on_response(&second, true, &local, &mut store, &mut Outbox::new());

        assert!(query.is_done());
        assert_eq!(query.stored(), &[peer(0x02)]);
    }
}
