use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::{NodeId, PeerDescriptor, RequestId};

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub request_id: RequestId,
    pub method: String,
    pub to: PeerDescriptor,
    pub sent_at: Instant,
    pub timeout: Duration,
    removed: bool,
}

impl InflightRequest {
    pub fn does_match(&self, from: &NodeId, request_id: &RequestId) -> bool {
        &self.request_id == request_id && self.to.node_id() == from
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.sent_at) >= self.timeout
    }
}

#[derive(Debug, Default)]
pub struct InflightRequests {
    // Insertion order, so expiry scans walk requests in the order they were sent.
    requests: Vec<InflightRequest>,
    // Position of each live request in `requests`.
    index: HashMap<RequestId, usize>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new inflight request O(1)
    pub fn add(&mut self, request_id: RequestId, method: &str, to: PeerDescriptor, timeout: Duration) {
        let pos = self.requests.len();
        self.requests.push(InflightRequest {
            request_id,
            method: method.to_string(),
            to,
            sent_at: Instant::now(),
            timeout,
            removed: false,
        });
        self.index.insert(request_id, pos);
    }

    /// Check if a request_id is still inflight O(1)
    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.index.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Remove inflight request by request_id if it exists and was sent to `from`.
    pub fn remove(&mut self, request_id: &RequestId, from: &NodeId) -> Option<InflightRequest> {
        let &pos = self.index.get(request_id)?;

        let request = self.requests.get_mut(pos)?;
        if request.removed || !request.does_match(from, request_id) {
            return None;
        }

        self.index.remove(request_id);
        request.removed = true;

        Some(request.clone())
    }

    /// Drop removed entries and return the requests whose deadline passed.
    pub fn cleanup(&mut self) -> Vec<InflightRequest> {
        let now = Instant::now();

        let mut expired = Vec::new();
        let mut kept = Vec::with_capacity(self.index.len());
        self.index.clear();

        for request in self.requests.drain(..) {
            if request.removed {
                continue;
            }

            if request.is_expired(now) {
                expired.push(request);
            } else {
                self.index.insert(request.request_id, kept.len());
                kept.push(request);
            }
        }

        self.requests = kept;

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_only_from_the_addressed_peer() {
        let mut inflight = InflightRequests::new();

        let peer = PeerDescriptor::random();
        let request_id = RequestId::random();

        inflight.add(request_id, "ping", peer.clone(), Duration::from_secs(5));

        assert!(inflight.remove(&request_id, &NodeId::random()).is_none());
        assert!(inflight.contains(&request_id));

        let removed = inflight.remove(&request_id, peer.node_id()).unwrap();
        assert_eq!(removed.method, "ping");
        assert!(!inflight.contains(&request_id));
        assert!(inflight.remove(&request_id, peer.node_id()).is_none());
    }

    #[test]
    fn cleanup_returns_expired() {
        let mut inflight = InflightRequests::new();

        let fast = RequestId::random();
        let slow = RequestId::random();
        let answered = RequestId::random();
        let peer = PeerDescriptor::random();

        inflight.add(fast, "ping", peer.clone(), Duration::ZERO);
        inflight.add(slow, "ping", peer.clone(), Duration::from_secs(60));
        inflight.add(answered, "ping", peer.clone(), Duration::ZERO);
        inflight.remove(&answered, peer.node_id());

        let expired = inflight.cleanup();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request_id, fast);
        assert!(inflight.contains(&slow));
        assert_eq!(inflight.len(), 1);

        assert!(inflight.remove(&slow, peer.node_id()).is_some());
    }
}
