//! In-process network connecting transports by [NodeId].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use flume::{Receiver, Sender};
use tracing::trace;

use crate::common::{NodeId, PeerDescriptor};

use super::{Transport, TransportError, MAX_THREAD_BLOCK_DURATION};

type Inboxes = HashMap<NodeId, Sender<Vec<u8>>>;

#[derive(Debug, Clone, Default)]
/// A lossless in-memory network. Every [SimulatorTransport] registers an
/// inbox under its [NodeId]; sending to an unknown id fails as unreachable.
pub struct Simulator {
    inboxes: Arc<Mutex<Inboxes>>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport for `peer`, replacing any previous one with the same id.
    pub fn transport(&self, peer: &PeerDescriptor) -> SimulatorTransport {
        let (sender, receiver) = flume::unbounded();

        self.inboxes().insert(*peer.node_id(), sender.clone());

        SimulatorTransport {
            id: *peer.node_id(),
            simulator: self.clone(),
            inbox: sender,
            receiver,
        }
    }

    /// Make `node_id` unreachable, as if its process died.
    pub fn disconnect(&self, node_id: &NodeId) {
        self.inboxes().remove(node_id);
    }

    pub fn len(&self) -> usize {
        self.inboxes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inboxes().is_empty()
    }

    fn inboxes(&self) -> MutexGuard<'_, Inboxes> {
        match self.inboxes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug)]
pub struct SimulatorTransport {
    id: NodeId,
    simulator: Simulator,
    inbox: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
}

impl Transport for SimulatorTransport {
    fn send(&mut self, target: &PeerDescriptor, bytes: &[u8]) -> Result<(), TransportError> {
        let inbox = self
            .simulator
            .inboxes()
            .get(target.node_id())
            .cloned()
            .ok_or(TransportError::Unreachable(*target.node_id()))?;

        trace!(context = "simulator", from = ?self.id, to = ?target.node_id(), len = bytes.len());

        inbox
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Unreachable(*target.node_id()))
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv_timeout(MAX_THREAD_BLOCK_DURATION).ok()
    }
}

impl Drop for SimulatorTransport {
    fn drop(&mut self) {
        let mut inboxes = self.simulator.inboxes();

        // Only remove our own inbox, a newer transport may have taken the id.
        if inboxes
            .get(&self.id)
            .map(|sender| sender.same_channel(&self.inbox))
            .unwrap_or(false)
        {
            inboxes.remove(&self.id);
        }
    }
}
