use std::collections::HashMap;

use crate::common::{NodeId, PeerDescriptor};

use super::{ConnectionId, ConnectionState};

/// Decides whether a connection between two peers can be formed in one direction.
pub trait Connector {
    fn is_possible_to_form_connection(&self, local: &PeerDescriptor, remote: &PeerDescriptor)
        -> bool;
}

#[derive(Debug, Default)]
/// Dials out to remote listeners, one attempt per remote at a time.
pub struct ClientConnector {
    connecting: HashMap<NodeId, ConnectionId>,
}

impl ClientConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The attempt already dialing `node_id`, if any.
    pub fn connecting(&self, node_id: &NodeId) -> Option<ConnectionId> {
        self.connecting.get(node_id).copied()
    }

    /// Return the inflight attempt to `remote`, or register `id` as a new one.
    ///
    /// The boolean is true when a new attempt was registered.
    pub fn connect(&mut self, remote: &PeerDescriptor, id: ConnectionId) -> (ConnectionId, bool) {
        match self.connecting.get(remote.node_id()) {
            Some(existing) => (*existing, false),
            None => {
                self.connecting.insert(*remote.node_id(), id);
                (id, true)
            }
        }
    }

    /// Release the attempt once it is settled either way.
    pub fn on_state_change(&mut self, node_id: &NodeId, state: ConnectionState) {
        match state {
            ConnectionState::Connected | ConnectionState::Disconnected => {
                self.connecting.remove(node_id);
            }
            ConnectionState::Connecting => {}
        }
    }
}

impl Connector for ClientConnector {
    /// A listener with TLS can be dialed by anyone, a plain one by native nodes only.
    fn is_possible_to_form_connection(
        &self,
        local: &PeerDescriptor,
        remote: &PeerDescriptor,
    ) -> bool {
        remote
            .websocket()
            .map(|websocket| websocket.tls() || !local.is_browser())
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
/// Accepts remotes dialing in to this node's listener.
pub struct ServerConnector;

impl ServerConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for ServerConnector {
    fn is_possible_to_form_connection(
        &self,
        local: &PeerDescriptor,
        remote: &PeerDescriptor,
    ) -> bool {
        if local.is_browser() {
            return false;
        }

        local
            .websocket()
            .map(|websocket| websocket.tls() || !remote.is_browser())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use crate::common::{ConnectivityMethod, NodeType};

    use super::*;

    fn native(websocket: Option<ConnectivityMethod>) -> PeerDescriptor {
        let peer = PeerDescriptor::new(NodeId::random(), NodeType::Native);

        match websocket {
            Some(websocket) => peer.with_websocket(websocket),
            None => peer,
        }
    }

    fn browser() -> PeerDescriptor {
        PeerDescriptor::new(NodeId::random(), NodeType::Browser)
    }

    #[test]
    fn tls_and_plain_native_nodes() {
        let tls = native(Some(ConnectivityMethod::new("1.1.1.1", 11, true)));
        let plain = native(Some(ConnectivityMethod::new("2.2.2.2", 22, false)));

        let client = ClientConnector::new();
        let server = ServerConnector::new();

        assert!(client.is_possible_to_form_connection(&tls, &plain));
        assert!(client.is_possible_to_form_connection(&plain, &tls));

        assert!(server.is_possible_to_form_connection(&tls, &plain));
        assert!(server.is_possible_to_form_connection(&plain, &tls));
    }

    #[test]
    fn browser_needs_tls() {
        let browser = browser();
        let plain = native(Some(ConnectivityMethod::new("2.2.2.2", 22, false)));
        let tls = native(Some(ConnectivityMethod::new("1.1.1.1", 11, true)));

        let client = ClientConnector::new();
        let server = ServerConnector::new();

        assert!(!client.is_possible_to_form_connection(&browser, &plain));
        assert!(client.is_possible_to_form_connection(&browser, &tls));

        // Seen from the native side.
        assert!(!server.is_possible_to_form_connection(&plain, &browser));
        assert!(server.is_possible_to_form_connection(&tls, &browser));
    }

    #[test]
    fn browser_never_accepts() {
        let browser = browser();
        let tls = native(Some(ConnectivityMethod::new("1.1.1.1", 11, true)));

        let client = ClientConnector::new();
        let server = ServerConnector::new();

        assert!(!server.is_possible_to_form_connection(&browser, &tls));
        assert!(!client.is_possible_to_form_connection(&tls, &browser));
    }

    #[test]
    fn no_listener_no_connection() {
        let client = ClientConnector::new();

        assert!(!client.is_possible_to_form_connection(&native(None), &native(None)));
    }

    #[test]
    fn dedupe_inflight_dials() {
        let remote = native(Some(ConnectivityMethod::new("1.1.1.1", 11, true)));
        let mut client = ClientConnector::new();

        let (first, new) = client.connect(&remote, ConnectionId(1));
        assert!(new);

        let (second, new) = client.connect(&remote, ConnectionId(2));
        assert!(!new);
        assert_eq!(first, second);

        client.on_state_change(remote.node_id(), ConnectionState::Connected);
        assert_eq!(client.connecting(remote.node_id()), None);

        let (third, new) = client.connect(&remote, ConnectionId(3));
        assert!(new);
        assert_eq!(third, ConnectionId(3));

        client.on_state_change(remote.node_id(), ConnectionState::Disconnected);

        let (_, new) = client.connect(&remote, ConnectionId(4));
        assert!(new);
    }
}
