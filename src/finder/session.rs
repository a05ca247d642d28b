use std::collections::HashMap;
use std::time::Instant;

use tracing::trace;

use crate::common::{
    ClosestPeers, DataEntry, NodeId, PeerDescriptor, RecursiveOperation, RecursiveOperationResponse,
    RequestId, MAX_BUCKET_SIZE_K,
};

use super::{merge_entry, RecursiveOperationResult};

#[derive(Debug)]
/// Origin side of a recursive operation, collecting the reports every hop
/// sends back while the request travels toward the target.
pub(crate) struct RecursiveSession {
    session_id: RequestId,
    operation: RecursiveOperation,
    results: ClosestPeers,
    entries: HashMap<NodeId, DataEntry>,
    reports: usize,
    no_closer_reports: usize,
    no_closer_reports_needed: usize,
    pub(crate) started_at: Instant,
}

impl RecursiveSession {
    pub fn new(
        session_id: RequestId,
        operation: RecursiveOperation,
        target: NodeId,
        no_closer_reports_needed: usize,
    ) -> Self {
        Self {
            session_id,
            operation,
            results: ClosestPeers::new(target),
            entries: HashMap::new(),
            reports: 0,
            no_closer_reports: 0,
            no_closer_reports_needed: no_closer_reports_needed.max(1),
            started_at: Instant::now(),
        }
    }

    pub fn session_id(&self) -> &RequestId {
        &self.session_id
    }

    pub fn operation(&self) -> RecursiveOperation {
        self.operation
    }

    pub fn reports(&self) -> usize {
        self.reports
    }

    /// Add what the origin itself knows.
    pub fn add_local(&mut self, local: PeerDescriptor, entries: Vec<DataEntry>) {
        self.results.add(local);

        for entry in entries {
            merge_entry(&mut self.entries, entry);
        }
    }

    /// Merge a hop's report. Returns true once the session is complete.
    pub fn on_report(&mut self, response: RecursiveOperationResponse) -> bool {
        self.reports += 1;

        trace!(
            session_id = ?self.session_id,
            hops = response.routing_path.len(),
            peers = response.closest_connected_peers.len(),
            entries = response.data_entries.len(),
            no_closer_nodes_found = response.no_closer_nodes_found,
            "Recursive operation report"
        );

        self.results.extend(response.closest_connected_peers);

        if let Some(last_hop) = response.routing_path.last() {
            self.results.add(last_hop.clone());
        }

        let target = *self.results.target();
        for entry in response.data_entries {
            if entry.key == target {
                merge_entry(&mut self.entries, entry);
            }
        }

        if response.no_closer_nodes_found {
            self.no_closer_reports += 1;
        }

        self.no_closer_reports >= self.no_closer_reports_needed
    }

    pub fn result(&self) -> RecursiveOperationResult {
        let mut data_entries = self.entries.values().cloned().collect::<Vec<_>>();
        data_entries.sort_by(|a, b| a.creator.node_id().cmp(b.creator.node_id()));

        RecursiveOperationResult {
            closest_nodes: self.results.closest(MAX_BUCKET_SIZE_K).to_vec(),
            data_entries,
        }
    }
}
