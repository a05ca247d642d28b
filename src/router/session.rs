use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tracing::trace;

use crate::common::{NodeId, PeerDescriptor, RequestId, RouteMessageWrapper};

use super::{RouterIo, RoutingMode};

/// Failed next hops tolerated before a session gives up.
pub const MAX_FAILED_HOPS: usize = 2;

#[derive(Debug)]
/// One routing attempt of a wrapper through this node, trying the closest
/// connected peers first.
pub(crate) struct RoutingSession {
    wrapper: RouteMessageWrapper,
    mode: RoutingMode,
    contacts: VecDeque<PeerDescriptor>,
    ongoing: HashMap<RequestId, NodeId>,
    parallelism: usize,
    successes: usize,
    failures: usize,
    pub(crate) started_at: Instant,
}

impl RoutingSession {
    pub fn new(
        wrapper: RouteMessageWrapper,
        mode: RoutingMode,
        contacts: Vec<PeerDescriptor>,
        parallelism: usize,
    ) -> Self {
        Self {
            wrapper,
            mode,
            contacts: contacts.into(),
            ongoing: HashMap::new(),
            parallelism,
            successes: 0,
            failures: 0,
            started_at: Instant::now(),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.wrapper.request_id
    }

    pub fn is_inflight(&self, request_id: &RequestId) -> bool {
        self.ongoing.contains_key(request_id)
    }

    /// Send to the next closest contacts until `parallelism` hops are in flight.
    pub fn send_more(&mut self, io: &mut dyn RouterIo) {
        while self.ongoing.len() < self.parallelism {
            let Some(contact) = self.contacts.pop_front() else {
                break;
            };

            trace!(request_id = ?self.wrapper.request_id, next_hop = ?contact.node_id(), mode = ?self.mode, "Routing to next hop");

            let request_id = io.send(self.mode, &contact, &self.wrapper);
            self.ongoing.insert(request_id, *contact.node_id());
        }
    }

    /// Record the ack of a hop. Returns `Some(success)` once the session is over.
    pub fn on_response(
        &mut self,
        request_id: &RequestId,
        succeeded: bool,
        io: &mut dyn RouterIo,
    ) -> Option<bool> {
        self.ongoing.remove(request_id)?;

        if succeeded {
            self.successes += 1;
        } else {
            self.failures += 1;

            if self.failures < MAX_FAILED_HOPS {
                self.send_more(io);
            }
        }

        self.outcome()
    }

    fn outcome(&self) -> Option<bool> {
        if self.successes >= self.parallelism {
            return Some(true);
        }

        if self.ongoing.is_empty() {
            return Some(self.successes > 0);
        }

        None
    }
}
