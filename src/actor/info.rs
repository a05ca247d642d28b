use crate::common::{NodeId, PeerDescriptor};

use super::Actor;

/// Information and statistics about this overlay node.
#[derive(Debug, Clone)]
pub struct Info {
    peer_descriptor: PeerDescriptor,
    local_port: Option<u16>,
    routing_table_size: usize,
    connections: usize,
    stored_entries: usize,
    messages_routed: usize,
    active_lookups: usize,
    bootstrapped: Option<bool>,
}

impl Info {
    /// This Node's [NodeId]
    pub fn id(&self) -> &NodeId {
        self.peer_descriptor.node_id()
    }

    /// The descriptor this node advertises to its peers.
    pub fn peer_descriptor(&self) -> &PeerDescriptor {
        &self.peer_descriptor
    }

    /// Port the transport listens on, `None` for in-process transports.
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }

    /// Number of open connections.
    pub fn connections(&self) -> usize {
        self.connections
    }

    /// Live entries in the local data store, tombstones included.
    pub fn stored_entries(&self) -> usize {
        self.stored_entries
    }

    /// Routing sessions this node started or relayed.
    pub fn messages_routed(&self) -> usize {
        self.messages_routed
    }

    /// Iterative lookups and recursive sessions still running.
    pub fn active_lookups(&self) -> usize {
        self.active_lookups
    }

    /// Returns `None` while bootstrapping, then whether any peer was found.
    pub fn bootstrapped(&self) -> Option<bool> {
        self.bootstrapped
    }
}

impl From<&Actor> for Info {
    fn from(actor: &Actor) -> Self {
        Self {
            peer_descriptor: actor.local_peer_descriptor().clone(),
            local_port: actor.local_port(),
            routing_table_size: actor.routing_table().size(),
            connections: actor.connections().connected_count(),
            stored_entries: actor.local_store().len(),
            messages_routed: actor.state.router.messages_routed(),
            active_lookups: actor.state.finder.active_queries()
                + actor.state.finder.active_sessions(),
            bootstrapped: actor.bootstrapped(),
        }
    }
}
