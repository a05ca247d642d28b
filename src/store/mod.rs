//! Replicated key/value storage: the local share of the data, and the
//! coordinator placing replicas on the peers closest to a key.

mod local;
mod query;

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{
    methods, unix_millis, ClosestPeers, DataEntry, DeleteDataRequest, DeleteDataResponse, NodeId,
    PeerDescriptor, ReplicateDataRequest, RequestId, RoutingTable, StoreDataRequest,
    StoreDataResponse,
};
use crate::finder::{LookupError, RecursiveOperationResult};
use crate::rpc::Outbox;

pub use local::LocalDataStore;

use query::{StoreQuery, StoreRequest};

/// Default ceiling of the ttl of entries stored on behalf of other peers.
pub const DEFAULT_STORE_MAX_TTL: Duration = Duration::from_secs(60);
/// Default ceiling, and default value, of the ttl of entries created by this node.
pub const DEFAULT_STORE_HIGHEST_TTL: Duration = Duration::from_secs(60);
/// Default number of replicas of a stored entry.
pub const DEFAULT_STORE_NUMBER_OF_COPIES: usize = 5;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    /// The lookup for the replica set failed.
    Lookup(#[from] LookupError),

    #[error("No peer accepted the request")]
    NoReplicas,
}

type Completed = (RequestId, Result<Vec<PeerDescriptor>, StoreError>);

#[derive(Debug)]
/// Publishes entries to, and deletes them from, the peers closest to their key.
///
/// Every operation first waits for a lookup of the replica set, identified
/// by the lookup's [RequestId], then writes to the closest candidates.
pub struct StoreManager {
    store_max_ttl: Duration,
    store_highest_ttl: Duration,
    copies: usize,
    awaiting_lookup: HashMap<RequestId, (NodeId, StoreRequest)>,
    queries: HashMap<RequestId, StoreQuery>,
    completed: Vec<Completed>,
}

impl StoreManager {
    pub fn new(store_max_ttl: Duration, store_highest_ttl: Duration, copies: usize) -> Self {
        Self {
            store_max_ttl,
            store_highest_ttl,
            copies: copies.max(1),
            awaiting_lookup: HashMap::new(),
            queries: HashMap::new(),
            completed: Vec::new(),
        }
    }

    // === Getters ===

    pub fn copies(&self) -> usize {
        self.copies
    }

    pub fn is_awaiting_lookup(&self, lookup_id: &RequestId) -> bool {
        self.awaiting_lookup.contains_key(lookup_id)
    }

    /// Returns true if `request_id` is a request of one of our store queries.
    pub fn owns(&self, request_id: &RequestId) -> bool {
        self.queries
            .values()
            .any(|query| query.is_inflight(request_id))
    }

    pub fn active_queries(&self) -> usize {
        self.awaiting_lookup.len() + self.queries.len()
    }

    /// Ttl of an entry created by this node, `store_highest_ttl` unless a lower one is asked.
    pub fn local_ttl(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.store_highest_ttl)
            .min(self.store_highest_ttl)
    }

    // === Public Methods ===

    /// Prepare storing `data` under `key` once the lookup `lookup_id` is done.
    pub fn store_data(
        &mut self,
        lookup_id: RequestId,
        local: &PeerDescriptor,
        key: NodeId,
        data: Bytes,
        ttl: Option<Duration>,
    ) {
        let entry = DataEntry {
            key,
            data,
            creator: local.clone(),
            ttl: self.local_ttl(ttl).as_millis() as u64,
            created_at: unix_millis(),
            stale: false,
            deleted: false,
        };

        self.awaiting_lookup
            .insert(lookup_id, (key, StoreRequest::Store(entry)));
    }

    /// Prepare deleting this node's entry under `key` once the lookup `lookup_id` is done.
    pub fn delete_data(&mut self, lookup_id: RequestId, key: NodeId) {
        self.awaiting_lookup
            .insert(lookup_id, (key, StoreRequest::Delete));
    }

    /// Start writing to the replica set found by the lookup `lookup_id`.
    pub fn on_lookup_done(
        &mut self,
        lookup_id: RequestId,
        result: Result<RecursiveOperationResult, LookupError>,
        local: &PeerDescriptor,
        store: &mut LocalDataStore,
        outbox: &mut Outbox,
    ) -> bool {
        let Some((key, request)) = self.awaiting_lookup.remove(&lookup_id) else {
            return false;
        };

        let candidates = match result {
            Ok(result) => result.closest_nodes,
            Err(error) => {
                debug!(?key, ?error, "Replica set lookup failed");
                self.completed.push((lookup_id, Err(error.into())));

                return true;
            }
        };

        trace!(?key, candidates = candidates.len(), "Replica set found");

        let mut query = StoreQuery::new(key, request, candidates, self.copies);
        query.start(local, store, outbox);

        self.queries.insert(lookup_id, query);
        self.complete_done_queries();

        true
    }

    /// Settle a `storeData` or `deleteData` request. Returns false if no query owns it.
    pub fn on_response(
        &mut self,
        request_id: &RequestId,
        accepted: bool,
        local: &PeerDescriptor,
        store: &mut LocalDataStore,
        outbox: &mut Outbox,
    ) -> bool {
        let owned = match self
            .queries
            .values_mut()
            .find(|query| query.is_inflight(request_id))
        {
            Some(query) => query.on_response(request_id, accepted, local, store, outbox),
            None => false,
        };

        if owned {
            self.complete_done_queries();
        }

        owned
    }

    /// Operations done since the last call, with the peers now holding the
    /// request, closest to the key first.
    pub fn take_completed(&mut self) -> Vec<Completed> {
        std::mem::take(&mut self.completed)
    }

    // === Request handlers ===

    /// Store an entry on behalf of `source`, clamping its ttl to `store_max_ttl`.
    pub fn handle_store_data(
        &self,
        request: StoreDataRequest,
        source: &PeerDescriptor,
        local: &PeerDescriptor,
        routing_table: &RoutingTable,
        store: &mut LocalDataStore,
    ) -> StoreDataResponse {
        let ttl = request.ttl.min(self.store_max_ttl.as_millis() as u64);

        let entry = DataEntry {
            key: request.key,
            data: request.data,
            creator: source.clone(),
            ttl,
            created_at: request.created_at,
            stale: !self.is_replica_holder(local, routing_table, &request.key),
            deleted: false,
        };

        trace!(key = ?entry.key, creator = ?source.node_id(), ttl, stale = entry.stale, "Storing entry");

        let (key, stale) = (entry.key, entry.stale);

        store.store_entry(entry);

        // Every replica we hold for a key we are no longer close to is stale.
        if stale {
            store.set_all_stale(&key);
        }

        StoreDataResponse {
            error: String::new(),
        }
    }

    /// Tombstone the entry `source` created under the key.
    pub fn handle_delete_data(
        &self,
        request: DeleteDataRequest,
        source: &PeerDescriptor,
        store: &mut LocalDataStore,
    ) -> DeleteDataResponse {
        DeleteDataResponse {
            deleted: store.mark_as_deleted(&request.key, source.node_id()),
        }
    }

    /// Keep a replica handed over by `source`, passing it on to the peers
    /// that should hold it too when it is news to this node.
    ///
    /// Returns how many peers the entry was passed on to.
    pub fn handle_replicate_data(
        &self,
        request: ReplicateDataRequest,
        source: &PeerDescriptor,
        local: &PeerDescriptor,
        routing_table: &RoutingTable,
        store: &mut LocalDataStore,
        outbox: &mut Outbox,
    ) -> usize {
        let mut entry = request.entry;
        entry.ttl = entry.ttl.min(self.store_max_ttl.as_millis() as u64);
        entry.stale = !self.is_replica_holder(local, routing_table, &entry.key);

        let known = store
            .get_entries(&entry.key)
            .get(entry.creator.node_id())
            .is_some_and(|existing| {
                existing.created_at == entry.created_at && existing.deleted == entry.deleted
            });

        let stale = entry.stale;
        let stored = store.store_entry(entry.clone());

        let passed_on = if stored && !known {
            self.replicate_to_neighbors(source, &entry, local, routing_table, outbox)
        } else {
            0
        };

        if stale {
            store.set_all_stale(&entry.key);
        }

        passed_on
    }

    /// Hand every entry we hold to the closest peers we know for its key,
    /// before this node leaves the network.
    pub fn hand_over_entries(
        &self,
        routing_table: &RoutingTable,
        store: &LocalDataStore,
        outbox: &mut Outbox,
    ) -> usize {
        let mut sent = 0;

        for entry in store.entries() {
            for peer in routing_table.closest_n(&entry.key, self.copies) {
                outbox.call(
                    methods::REPLICATE_DATA,
                    &ReplicateDataRequest {
                        entry: entry.clone(),
                    },
                    &peer,
                );
                sent += 1;
            }
        }

        if sent > 0 {
            debug!(replicas = sent, "Handing entries over before leaving");
        }

        sent
    }

    /// Hand our entries over to a new contact that joins their replica set.
    ///
    /// Only entries for which this node is the closest known holder are sent,
    /// so a contact gets each entry once.
    pub fn on_new_contact(
        &self,
        contact: &PeerDescriptor,
        local: &PeerDescriptor,
        routing_table: &RoutingTable,
        store: &LocalDataStore,
        outbox: &mut Outbox,
    ) -> usize {
        let mut sent = 0;

        for entry in store.entries() {
            let mut holders = ClosestPeers::new(entry.key);
            holders.add(local.clone());
            holders.extend(
                routing_table
                    .closest(&entry.key)
                    .into_iter()
                    .filter(|peer| peer.node_id() != contact.node_id()),
            );

            if holders.first().map(|first| first.node_id()) != Some(local.node_id()) {
                continue;
            }

            holders.add(contact.clone());

            if !holders.closest(self.copies).contains(contact) {
                continue;
            }

            outbox.call(
                methods::REPLICATE_DATA,
                &ReplicateDataRequest {
                    entry: entry.clone(),
                },
                contact,
            );
            sent += 1;
        }

        if sent > 0 {
            debug!(contact = ?contact.node_id(), entries = sent, "Replicating entries to new contact");
        }

        sent
    }

    // === Private Methods ===

    /// Pass a freshly replicated entry on: to every other holder of its
    /// replica set when this node is the closest, otherwise only to the closest.
    fn replicate_to_neighbors(
        &self,
        source: &PeerDescriptor,
        entry: &DataEntry,
        local: &PeerDescriptor,
        routing_table: &RoutingTable,
        outbox: &mut Outbox,
    ) -> usize {
        let mut holders = ClosestPeers::new(entry.key);
        holders.add(local.clone());
        holders.extend(routing_table.closest(&entry.key));

        let closest = holders.closest(self.copies);

        let targets = match closest.first() {
            Some(first) if first.node_id() == local.node_id() => &closest[1..],
            _ => &closest[..closest.len().min(1)],
        };

        let mut sent = 0;

        for peer in targets
            .iter()
            .filter(|peer| peer.node_id() != source.node_id() && peer.node_id() != local.node_id())
        {
            outbox.call(
                methods::REPLICATE_DATA,
                &ReplicateDataRequest {
                    entry: entry.clone(),
                },
                peer,
            );
            sent += 1;
        }

        if sent > 0 {
            trace!(key = ?entry.key, peers = sent, "Passing replica on");
        }

        sent
    }

    /// Returns true if this node is among the `copies` closest peers it knows for `key`.
    fn is_replica_holder(
        &self,
        local: &PeerDescriptor,
        routing_table: &RoutingTable,
        key: &NodeId,
    ) -> bool {
        let mut holders = ClosestPeers::new(*key);
        holders.add(local.clone());
        holders.extend(routing_table.closest(key));

        holders.closest(self.copies).contains(local)
    }

    fn complete_done_queries(&mut self) {
        let done = self
            .queries
            .iter()
            .filter(|(_, query)| query.is_done())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in done {
            if let Some(query) = self.queries.remove(&id) {
                let stored = query.stored().to_vec();

                debug!(key = ?query.key(), replicas = stored.len(), "Store query done");

                let result = if stored.is_empty() {
                    Err(StoreError::NoReplicas)
                } else {
                    Ok(stored)
                };

                self.completed.push((id, result));
            }
        }
    }
}
