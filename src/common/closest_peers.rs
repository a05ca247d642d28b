use std::vec::IntoIter;

use crate::common::{NodeId, PeerDescriptor};

#[derive(Debug, Clone)]
/// Peers sorted by XOR distance to a target, without duplicates.
pub struct ClosestPeers {
    target: NodeId,
    peers: Vec<PeerDescriptor>,
}

impl ClosestPeers {
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            peers: Vec::with_capacity(64),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn peers(&self) -> &[PeerDescriptor] {
        &self.peers
    }

    /// The `n` closest peers.
    pub fn closest(&self, n: usize) -> &[PeerDescriptor] {
        &self.peers[..n.min(self.peers.len())]
    }

    pub fn first(&self) -> Option<&PeerDescriptor> {
        self.peers.first()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.position(node_id).is_some()
    }

    // === Public Methods ===

    /// Insert a peer at its sorted position. Returns `false` if a peer with
    /// the same [NodeId] is already present.
    pub fn add(&mut self, peer: PeerDescriptor) -> bool {
        let seek = peer.node_id().distance(&self.target);

        // Equal distances to the same target imply equal ids.
        match self
            .peers
            .binary_search_by(|peer| peer.node_id().distance(&self.target).cmp(&seek))
        {
            Err(pos) => {
                self.peers.insert(pos, peer);
                true
            }
            Ok(_) => false,
        }
    }

    pub fn remove(&mut self, node_id: &NodeId) -> Option<PeerDescriptor> {
        self.position(node_id).map(|pos| self.peers.remove(pos))
    }

    fn position(&self, node_id: &NodeId) -> Option<usize> {
        let seek = node_id.distance(&self.target);

        self.peers
            .binary_search_by(|peer| peer.node_id().distance(&self.target).cmp(&seek))
            .ok()
    }
}

impl IntoIterator for ClosestPeers {
    type Item = PeerDescriptor;
    type IntoIter = IntoIter<PeerDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.into_iter()
    }
}

impl Extend<PeerDescriptor> for ClosestPeers {
    fn extend<T: IntoIterator<Item = PeerDescriptor>>(&mut self, iter: T) {
        for peer in iter {
            self.add(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sorted_by_distance() {
        let target = NodeId::random();

        let mut closest = ClosestPeers::new(target);

        for _ in 0..100 {
            closest.add(PeerDescriptor::random());
        }

        closest.add(PeerDescriptor::new(target, crate::NodeType::Native));

        assert_eq!(closest.len(), 101);
        assert_eq!(closest.first().map(|p| *p.node_id()), Some(target));

        let distances = closest
            .peers()
            .iter()
            .map(|peer| peer.node_id().distance(&target))
            .collect::<Vec<_>>();

        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(sorted, distances);
    }

    #[test]
    fn deduplicate_by_node_id() {
        let mut closest = ClosestPeers::new(NodeId::random());

        let peer = PeerDescriptor::random();
        let same_id = PeerDescriptor::new(*peer.node_id(), crate::NodeType::Browser);

        assert!(closest.add(peer));
        assert!(!closest.add(same_id));
        assert_eq!(closest.len(), 1);
    }

    #[test]
    fn remove() {
        let mut closest = ClosestPeers::new(NodeId::random());

        let peer = PeerDescriptor::random();
        closest.add(PeerDescriptor::random());
        closest.add(peer.clone());

        assert!(closest.contains(peer.node_id()));
        assert_eq!(closest.remove(peer.node_id()), Some(peer.clone()));
        assert!(!closest.contains(peer.node_id()));
        assert_eq!(closest.len(), 1);
    }
}
