//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::common::{ClosestPeers, NodeId, PeerDescriptor, MAX_DISTANCE};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 8;

/// A contact not seen for this long may be replaced by a newcomer in a full bucket.
pub const STALE_TIME: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: NodeId,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: NodeId) -> Self {
        let buckets = BTreeMap::new();

        RoutingTable { id, buckets }
    }

    /// Returns the [NodeId] of this node, where the distance is measured from.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    // === Public Methods ===

    /// Attempts to add a peer to this routing table, and return `true` if it did.
    ///
    /// Adding a peer that is already known refreshes its position in its bucket.
    pub fn add(&mut self, peer: PeerDescriptor) -> bool {
        let distance = self.id.log_distance(peer.node_id());

        if distance == 0 {
            // Do not add self to the routing_table
            return false;
        }

        let bucket = self.buckets.entry(distance).or_default();

        bucket.add(peer)
    }

    /// Remove a peer from this routing table, returns `true` if it was there.
    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        let distance = self.id.log_distance(node_id);

        self.buckets
            .get_mut(&distance)
            .map(|bucket| bucket.remove(node_id))
            .unwrap_or(false)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        let distance = self.id.log_distance(node_id);

        self.buckets
            .get(&distance)
            .map(|bucket| bucket.contains(node_id))
            .unwrap_or(false)
    }

    /// Return the [MAX_BUCKET_SIZE_K] closest peers to the target.
    pub fn closest(&self, target: &NodeId) -> Vec<PeerDescriptor> {
        self.closest_n(target, MAX_BUCKET_SIZE_K)
    }

    /// Return the `n` closest peers to the target.
    pub fn closest_n(&self, target: &NodeId, n: usize) -> Vec<PeerDescriptor> {
        let mut closest = ClosestPeers::new(*target);

        closest.extend(self.peers());

        closest.closest(n).to_vec()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of peers in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.contacts.len())
    }

    /// Returns an iterator over the peers in this routing table, closest buckets first.
    pub fn peers(&self) -> impl Iterator<Item = PeerDescriptor> + '_ {
        self.buckets
            .range(1..=MAX_DISTANCE)
            .flat_map(|(_, bucket)| bucket.contacts.iter().map(|c| c.peer.clone()))
    }
}

#[derive(Debug, Clone)]
struct Contact {
    peer: PeerDescriptor,
    last_seen: Instant,
}

impl Contact {
    fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > STALE_TIME
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Contacts in the k-bucket, sorted by the least recently seen.
    contacts: Vec<Contact>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            contacts: Vec::with_capacity(MAX_BUCKET_SIZE_K),
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, incoming: PeerDescriptor) -> bool {
        let contact = Contact {
            peer: incoming,
            last_seen: Instant::now(),
        };

        if let Some(index) = self
            .contacts
            .iter()
            .position(|c| c.peer.node_id() == contact.peer.node_id())
        {
            // Refresh last_seen and move to the end of the bucket, taking the
            // latest advertised descriptor.
            self.contacts.remove(index);
            self.contacts.push(contact);

            true
        } else if self.contacts.len() < MAX_BUCKET_SIZE_K {
            self.contacts.push(contact);
            true
        } else if self.contacts[0].is_stale() {
            // Remove the least recently seen contact and add the new one
            self.contacts.remove(0);
            self.contacts.push(contact);

            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        let before = self.contacts.len();
        self.contacts.retain(|c| c.peer.node_id() != node_id);

        before != self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    fn contains(&self, node_id: &NodeId) -> bool {
        self.contacts.iter().any(|c| c.peer.node_id() == node_id)
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use crate::common::{
        ConnectivityMethod, KBucket, NodeId, NodeType, PeerDescriptor, RoutingTable,
        MAX_BUCKET_SIZE_K,
    };

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(NodeId::random());
        assert!(table.is_empty());

        table.add(PeerDescriptor::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn contains() {
        let mut table = RoutingTable::new(NodeId::random());

        let peer = PeerDescriptor::random();

        assert!(!table.contains(peer.node_id()));

        table.add(peer.clone());
        assert!(table.contains(peer.node_id()));
    }

    #[test]
    fn remove() {
        let mut table = RoutingTable::new(NodeId::random());

        let peer = PeerDescriptor::random();

        table.add(peer.clone());
        assert!(table.remove(peer.node_id()));
        assert!(!table.contains(peer.node_id()));
        assert!(!table.remove(peer.node_id()));
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(NodeId::random());

        let peer1 = PeerDescriptor::random();
        let peer2 = PeerDescriptor::new(*peer1.node_id(), NodeType::Browser);

        table.add(peer1);
        table.add(peer2);

        assert_eq!(table.size(), 1);
        assert!(table.peers().all(|p| p.is_browser()));
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(NodeId::random());
        let peer = PeerDescriptor::new(*table.id(), NodeType::Native);

        assert!(!table.add(peer));
        assert!(table.is_empty())
    }

    #[test]
    fn should_not_add_more_than_k() {
        let mut bucket = KBucket::new();

        for i in 0..MAX_BUCKET_SIZE_K {
            assert!(bucket.add(PeerDescriptor::random()), "Failed to add peer {i}");
        }

        assert!(!bucket.add(PeerDescriptor::random()));
    }

    #[test]
    fn should_replace_stale_contact() {
        let mut bucket = KBucket::new();

        for _ in 0..MAX_BUCKET_SIZE_K {
            bucket.add(PeerDescriptor::random());
        }

        let Some(stale_time) =
            Instant::now().checked_sub(super::STALE_TIME + Duration::from_secs(1))
        else {
            // Monotonic clock started too recently to fake a stale contact.
            return;
        };
        bucket.contacts[0].last_seen = stale_time;
        let stale = bucket.contacts[0].peer.clone();

        let incoming = PeerDescriptor::random();
        assert!(bucket.add(incoming.clone()));
        assert!(!bucket.contains(stale.node_id()));
        assert!(bucket.contains(incoming.node_id()));
    }

    #[test]
    fn should_refresh_existing_contact() {
        let mut bucket = KBucket::new();

        let peer = PeerDescriptor::random();
        let updated = PeerDescriptor::new(*peer.node_id(), NodeType::Native)
            .with_websocket(ConnectivityMethod::new("127.0.0.1", 1, false));

        bucket.add(peer.clone());
        bucket.add(PeerDescriptor::random());

        assert_ne!(bucket.contacts[1].peer.node_id(), peer.node_id());

        bucket.add(updated);

        assert_eq!(bucket.contacts.len(), 2);
        assert_eq!(bucket.contacts[1].peer.node_id(), peer.node_id());
        assert!(bucket.contacts[1].peer.websocket().is_some());
    }

    #[test]
    fn closest() {
        let mut table = RoutingTable::new(NodeId::random());

        for _ in 0..200 {
            table.add(PeerDescriptor::random());
        }

        let target = NodeId::random();
        let closest = table.closest(&target);

        assert!(closest.len() <= MAX_BUCKET_SIZE_K);
        assert!(!closest.is_empty());

        let furthest = closest[closest.len() - 1].node_id().distance(&target);

        for peer in table.peers() {
            if !closest.contains(&peer) {
                assert!(peer.node_id().distance(&target) > furthest);
            }
        }
    }
}
